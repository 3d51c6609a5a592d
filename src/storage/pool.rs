//! Dictionary codec for string columns.
//!
//! On disk a string column is a vector of xxh3 codes plus the
//! code-to-string dictionary, so repeated categorical values (event
//! type, country) cost eight bytes per row regardless of string length.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use xxhash_rust::xxh3::xxh3_64;

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringPool {
    strings: HashMap<u64, String>,
}

impl StringPool {
    /// Dictionary-encodes a string column: nulls stay null, every other
    /// value becomes its xxh3 code, with the string itself captured once
    /// in the dictionary.
    pub fn encode(values: &[Option<String>]) -> (StringPool, Vec<Option<u64>>) {
        let mut pool = StringPool::default();
        let codes = values
            .iter()
            .map(|value| {
                value.as_ref().map(|s| {
                    let code = xxh3_64(s.as_bytes());
                    pool.strings.entry(code).or_insert_with(|| s.clone());
                    code
                })
            })
            .collect();
        (pool, codes)
    }

    /// Rebuilds the column from its codes. A code the dictionary does
    /// not know means the file is corrupt.
    pub fn decode(&self, codes: Vec<Option<u64>>) -> io::Result<Vec<Option<String>>> {
        codes
            .into_iter()
            .map(|code| {
                code.map(|c| {
                    self.strings
                        .get(&c)
                        .cloned()
                        .ok_or_else(|| io::Error::other("string code missing from dictionary"))
                })
                .transpose()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_dedupes_repeated_values() {
        let values = vec![
            Some("impression".to_string()),
            None,
            Some("impression".to_string()),
            Some("US".to_string()),
        ];
        let (pool, codes) = StringPool::encode(&values);
        assert_eq!(codes[0], codes[2]);
        assert_eq!(codes[1], None);
        assert_eq!(pool.strings.len(), 2);
    }

    #[test]
    fn test_round_trip() {
        let values = vec![Some("US".to_string()), None, Some("DE".to_string())];
        let (pool, codes) = StringPool::encode(&values);
        assert_eq!(pool.decode(codes).unwrap(), values);
    }

    #[test]
    fn test_unknown_code_is_corruption() {
        let (pool, _) = StringPool::encode(&[Some("US".to_string())]);
        assert!(pool.decode(vec![Some(0xdead_beef)]).is_err());
    }
}
