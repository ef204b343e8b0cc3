//! Block arguments and the compact block-string grammar.
//!
//! A block string describes one stage of the network, for example
//! `r1_k3_s11_e1_i32_o16_se0.25`:
//!
//! | token    | meaning                                   |
//! |----------|-------------------------------------------|
//! | `r`      | number of times the block is repeated     |
//! | `k`      | depthwise kernel size                     |
//! | `s`      | stride, one digit or two equal digits     |
//! | `e`      | expansion ratio                           |
//! | `i`, `o` | input and output filters                  |
//! | `se`     | squeeze-excite ratio (optional)           |
//! | `noskip` | disable the identity skip connection      |

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::warn;

const NO_SKIP: &str = "noskip";
const REQUIRED_KEYS: [&str; 6] = ["r", "k", "s", "e", "i", "o"];

/// Arguments of one network stage.
///
/// The stride is square: one value applies to both spatial axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockArgs {
    pub num_repeat: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub expand_ratio: usize,
    pub input_filters: usize,
    pub output_filters: usize,
    pub se_ratio: Option<f64>,
    pub id_skip: bool,
}

impl BlockArgs {
    /// Check the record against the grammar's constraints.
    pub fn validate(&self) -> Result<()> {
        if self.num_repeat == 0 {
            return Err(Error::InvalidSpec("num_repeat must be at least 1".to_string()));
        }
        if self.kernel_size == 0 {
            return Err(Error::InvalidSpec("kernel_size must be positive".to_string()));
        }
        if !(1..=9).contains(&self.stride) {
            return Err(Error::InvalidSpec(format!(
                "stride must be a single digit in 1..=9, got {}",
                self.stride
            )));
        }
        if self.expand_ratio == 0 {
            return Err(Error::InvalidSpec("expand_ratio must be at least 1".to_string()));
        }
        if let Some(se) = self.se_ratio {
            if !(se > 0.0 && se <= 1.0) {
                return Err(Error::InvalidSpec(format!(
                    "se_ratio must lie in (0, 1], got {}",
                    se
                )));
            }
        }
        Ok(())
    }

    /// Stride as `[height, width]`
    pub fn strides(&self) -> [usize; 2] {
        [self.stride, self.stride]
    }

    /// Whether the block carries a squeeze-excite sub-block
    pub fn has_se(&self) -> bool {
        self.se_ratio.is_some_and(|se| se > 0.0 && se <= 1.0)
    }
}

impl FromStr for BlockArgs {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        decode_block(s)
    }
}

impl std::fmt::Display for BlockArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&canonical_string(self))
    }
}

/// Split a token into its letter key and numeric value.
fn split_token(token: &str) -> Option<(&str, &str)> {
    let at = token.find(|c: char| c.is_ascii_digit())?;
    let (key, value) = token.split_at(at);
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    Some((key, value))
}

fn parse_int(options: &BTreeMap<&str, &str>, key: &str) -> Result<usize> {
    let raw = options
        .get(key)
        .ok_or_else(|| Error::InvalidSpec(format!("missing required key '{}'", key)))?;
    raw.parse()
        .map_err(|_| Error::InvalidSpec(format!("key '{}' expects an integer, got '{}'", key, raw)))
}

fn parse_stride(raw: &str) -> Result<usize> {
    let digits: Vec<u32> = raw
        .chars()
        .map(|c| c.to_digit(10))
        .collect::<Option<_>>()
        .ok_or_else(|| Error::InvalidSpec(format!("stride must be digits, got '{}'", raw)))?;

    match digits.as_slice() {
        [s] => Ok(*s as usize),
        [sh, sw] if sh == sw => Ok(*sh as usize),
        [_, _] => Err(Error::InvalidSpec(format!(
            "only square strides are supported, got 's{}'",
            raw
        ))),
        _ => Err(Error::InvalidSpec(format!(
            "stride must be one digit or two equal digits, got 's{}'",
            raw
        ))),
    }
}

/// Decode one block string.
pub fn decode_block(block_string: &str) -> Result<BlockArgs> {
    let mut options: BTreeMap<&str, &str> = BTreeMap::new();
    let mut id_skip = true;

    for token in block_string.split('_') {
        if token == NO_SKIP {
            id_skip = false;
            continue;
        }

        let (key, value) = split_token(token).ok_or_else(|| {
            Error::InvalidSpec(format!("malformed token '{}' in '{}'", token, block_string))
        })?;

        if !REQUIRED_KEYS.contains(&key) && key != "se" {
            return Err(Error::InvalidSpec(format!(
                "unknown key '{}' in '{}'",
                key, block_string
            )));
        }
        if options.insert(key, value).is_some() {
            warn!("Duplicate key '{}' in block string '{}', last value wins", key, block_string);
        }
    }

    if let Some(missing) = REQUIRED_KEYS.iter().find(|k| !options.contains_key(*k)) {
        return Err(Error::InvalidSpec(format!(
            "missing required key '{}' in '{}'",
            missing, block_string
        )));
    }

    let se_ratio = match options.get("se") {
        Some(raw) => Some(raw.parse::<f64>().map_err(|_| {
            Error::InvalidSpec(format!("key 'se' expects a number, got '{}'", raw))
        })?),
        None => None,
    };

    let block = BlockArgs {
        num_repeat: parse_int(&options, "r")?,
        kernel_size: parse_int(&options, "k")?,
        stride: parse_stride(options["s"])?,
        expand_ratio: parse_int(&options, "e")?,
        input_filters: parse_int(&options, "i")?,
        output_filters: parse_int(&options, "o")?,
        se_ratio,
        id_skip,
    };
    block.validate()?;

    Ok(block)
}

fn canonical_string(block: &BlockArgs) -> String {
    let mut args = vec![
        format!("r{}", block.num_repeat),
        format!("k{}", block.kernel_size),
        format!("s{}{}", block.stride, block.stride),
        format!("e{}", block.expand_ratio),
        format!("i{}", block.input_filters),
        format!("o{}", block.output_filters),
    ];
    if let Some(se) = block.se_ratio.filter(|_| block.has_se()) {
        args.push(format!("se{}", se));
    }
    if !block.id_skip {
        args.push(NO_SKIP.to_string());
    }
    args.join("_")
}

/// Encode one block into its canonical string form.
pub fn encode_block(block: &BlockArgs) -> Result<String> {
    block.validate()?;
    Ok(canonical_string(block))
}

/// Decode a list of block strings, preserving order.
pub fn decode_all<S: AsRef<str>>(block_strings: &[S]) -> Result<Vec<BlockArgs>> {
    block_strings.iter().map(|s| decode_block(s.as_ref())).collect()
}

/// Encode a list of blocks, preserving order.
pub fn encode_all(blocks: &[BlockArgs]) -> Result<Vec<String>> {
    blocks.iter().map(encode_block).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_first_stage() {
        let block = decode_block("r1_k3_s11_e1_i32_o16_se0.25").unwrap();
        assert_eq!(
            block,
            BlockArgs {
                num_repeat: 1,
                kernel_size: 3,
                stride: 1,
                expand_ratio: 1,
                input_filters: 32,
                output_filters: 16,
                se_ratio: Some(0.25),
                id_skip: true,
            }
        );
    }

    #[test]
    fn test_decode_duplicated_stride_digits() {
        let block = decode_block("r2_k3_s22_e6_i16_o24_se0.25").unwrap();
        assert_eq!(block.stride, 2);
        assert_eq!(block.strides(), [2, 2]);
        assert_eq!(block.num_repeat, 2);
        assert_eq!(block.expand_ratio, 6);
    }

    #[test]
    fn test_decode_single_stride_digit() {
        let block = decode_block("r1_k5_s2_e6_i24_o40").unwrap();
        assert_eq!(block.stride, 2);
        assert_eq!(block.se_ratio, None);
        assert!(!block.has_se());
    }

    #[test]
    fn test_decode_rejects_unequal_stride() {
        let err = decode_block("r1_k3_s12_e1_i32_o16_se0.25").unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[test]
    fn test_decode_rejects_missing_key() {
        let err = decode_block("r1_k3_s11_e1_i32").unwrap_err();
        match err {
            Error::InvalidSpec(msg) => assert!(msg.contains("'o'")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_malformed_tokens() {
        assert!(decode_block("r1_k3_s11_e1_i32_o16_bogus").is_err());
        assert!(decode_block("r1__k3_s11_e1_i32_o16").is_err());
        assert!(decode_block("r1_k3_s11_e1_i32_o16_x7").is_err());
        assert!(decode_block("r1_k3_s111_e1_i32_o16").is_err());
        assert!(decode_block("r1_k3_s11_e1_i32_o16_sehalf5").is_err());
        assert!(decode_block("r1_k3_s11_e1.5_i32_o16").is_err());
    }

    #[test]
    fn test_decode_rejects_out_of_range_se() {
        assert!(decode_block("r1_k3_s11_e1_i32_o16_se1.5").is_err());
        assert!(decode_block("r1_k3_s11_e1_i32_o16_se0").is_err());
    }

    #[test]
    fn test_decode_noskip() {
        let block = decode_block("r1_k3_s11_e1_i32_o16_se0.25_noskip").unwrap();
        assert!(!block.id_skip);
    }

    #[test]
    fn test_encode_canonical_form() {
        let block = decode_block("r3_k5_s2_e6_i80_o112_noskip").unwrap();
        assert_eq!(encode_block(&block).unwrap(), "r3_k5_s22_e6_i80_o112_noskip");
        assert_eq!(block.to_string(), "r3_k5_s22_e6_i80_o112_noskip");
    }

    #[test]
    fn test_encode_decode_preserves_baseline() {
        let strings = [
            "r1_k3_s11_e1_i32_o16_se0.25",
            "r2_k3_s22_e6_i16_o24_se0.25",
            "r4_k5_s22_e6_i112_o192_se0.25_noskip",
        ];
        let blocks = decode_all(&strings).unwrap();
        let encoded = encode_all(&blocks).unwrap();
        assert_eq!(encoded, strings);
        assert_eq!(decode_all(&encoded).unwrap(), blocks);
    }

    #[test]
    fn test_encode_rejects_invalid_record() {
        let block = BlockArgs {
            num_repeat: 1,
            kernel_size: 3,
            stride: 12,
            expand_ratio: 1,
            input_filters: 32,
            output_filters: 16,
            se_ratio: None,
            id_skip: true,
        };
        assert!(matches!(encode_block(&block), Err(Error::InvalidSpec(_))));
    }

    #[test]
    fn test_from_str() {
        let block: BlockArgs = "r1_k3_s11_e6_i192_o320_se0.25".parse().unwrap();
        assert_eq!(block.output_filters, 320);
    }

    #[test]
    fn test_decode_all_propagates_first_error() {
        let err = decode_all(&["r1_k3_s11_e1_i32_o16", "r1_k3_s12_e1_i32_o16"]).unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }
}
