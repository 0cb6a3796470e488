//! Minimal EVM ABI support for read calls and event logs: signature
//! parsing, call-data encoding for static argument types, and word-wise
//! decoding of return tuples and log payloads. Exotic types belong in an
//! external chain adapter, not here.

use alloy_primitives::{keccak256, Address, B256, U256};

use crate::{error::LoadError, value::Value};

/// `name(inputs)(outputs)` method signature, e.g.
/// `balanceOf(address)(uint256)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSig {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl MethodSig {
    pub fn parse(signature: &str) -> Result<MethodSig, LoadError> {
        let bad = || LoadError::Payload(format!("invalid method signature '{signature}'"));
        let signature = signature.trim();
        let open = signature.find('(').ok_or_else(bad)?;
        let name = signature[..open].trim().to_string();
        if name.is_empty() {
            return Err(bad());
        }

        let rest = &signature[open..];
        let close = rest.find(')').ok_or_else(bad)?;
        let inputs = split_types(&rest[1..close]);

        let outputs = match rest[close + 1..].trim() {
            "" => Vec::new(),
            tail => {
                let tail = tail.strip_prefix('(').ok_or_else(bad)?;
                let tail = tail.strip_suffix(')').ok_or_else(bad)?;
                split_types(tail)
            }
        };

        Ok(MethodSig {
            name,
            inputs,
            outputs,
        })
    }

    pub fn canonical(&self) -> String {
        format!("{}({})", self.name, self.inputs.join(","))
    }

    /// Four-byte function selector.
    pub fn selector(&self) -> [u8; 4] {
        let hash = keccak256(self.canonical().as_bytes());
        [hash[0], hash[1], hash[2], hash[3]]
    }

    /// ABI-encode call data from JSON parameters. Static types only.
    pub fn encode_call(&self, params: &[serde_json::Value]) -> Result<Vec<u8>, LoadError> {
        if params.len() != self.inputs.len() {
            return Err(LoadError::Payload(format!(
                "{} expects {} arguments, got {}",
                self.canonical(),
                self.inputs.len(),
                params.len()
            )));
        }
        let mut data = self.selector().to_vec();
        for (ty, param) in self.inputs.iter().zip(params) {
            data.extend_from_slice(&encode_word(ty, param)?);
        }
        Ok(data)
    }

    /// Decode the return blob into one value per declared output.
    pub fn decode_output(&self, data: &[u8]) -> Result<Vec<Value>, LoadError> {
        decode_words(&self.outputs, data)
    }
}

/// `Name(type [indexed] name, ...)` event signature.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSig {
    pub name: String,
    pub param_types: Vec<String>,
    pub indexed: Vec<bool>,
}

impl EventSig {
    pub fn parse(signature: &str) -> Result<EventSig, LoadError> {
        let bad = || LoadError::Payload(format!("invalid event signature '{signature}'"));
        let signature = signature.trim();
        let open = signature.find('(').ok_or_else(bad)?;
        let close = signature.rfind(')').ok_or_else(bad)?;
        let name = signature[..open].trim().to_string();
        if name.is_empty() || close < open {
            return Err(bad());
        }

        let mut param_types = Vec::new();
        let mut indexed = Vec::new();
        for param in split_types(&signature[open + 1..close]) {
            let words: Vec<&str> = param.split_whitespace().collect();
            match words.as_slice() {
                [] => continue,
                [ty, ..] => {
                    param_types.push(ty.to_string());
                    indexed.push(words.contains(&"indexed"));
                }
            }
        }

        Ok(EventSig {
            name,
            param_types,
            indexed,
        })
    }

    pub fn canonical(&self) -> String {
        format!("{}({})", self.name, self.param_types.join(","))
    }

    /// topic0: keccak of the canonical form.
    pub fn topic0(&self) -> B256 {
        keccak256(self.canonical().as_bytes())
    }

    /// Decode one log into its declaration-order positional tuple:
    /// indexed params come from `topics[1..]`, the rest from `data`.
    pub fn decode_log(&self, topics: &[B256], data: &[u8]) -> Result<Vec<Value>, LoadError> {
        let indexed_types: Vec<String> = self
            .param_types
            .iter()
            .zip(&self.indexed)
            .filter(|(_, i)| **i)
            .map(|(t, _)| t.clone())
            .collect();
        let plain_types: Vec<String> = self
            .param_types
            .iter()
            .zip(&self.indexed)
            .filter(|(_, i)| !**i)
            .map(|(t, _)| t.clone())
            .collect();

        if topics.len() < indexed_types.len() + 1 {
            return Err(LoadError::Payload(format!(
                "log for {} has {} topics, expected {}",
                self.canonical(),
                topics.len(),
                indexed_types.len() + 1
            )));
        }

        let mut from_topics = Vec::with_capacity(indexed_types.len());
        for (i, ty) in indexed_types.iter().enumerate() {
            from_topics.push(decode_word(ty, topics[i + 1].as_slice())?);
        }
        let mut from_data = decode_words(&plain_types, data)?.into_iter();

        // back to declaration order
        let mut from_topics = from_topics.into_iter();
        let mut out = Vec::with_capacity(self.indexed.len());
        for is_indexed in &self.indexed {
            let value = if *is_indexed {
                from_topics.next()
            } else {
                from_data.next()
            };
            out.push(value.ok_or_else(|| {
                LoadError::Payload(format!("log for {} truncated", self.canonical()))
            })?);
        }
        Ok(out)
    }
}

fn split_types(inner: &str) -> Vec<String> {
    inner
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn encode_word(ty: &str, param: &serde_json::Value) -> Result<[u8; 32], LoadError> {
    let bad = |msg: String| LoadError::Payload(msg);
    let mut word = [0u8; 32];

    if ty == "address" {
        let addr: Address = param
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| bad(format!("cannot encode {param} as address")))?;
        word[12..].copy_from_slice(addr.as_slice());
        return Ok(word);
    }
    if ty == "bool" {
        word[31] = param.as_bool().unwrap_or(false) as u8;
        return Ok(word);
    }
    if ty.starts_with("uint") || ty.starts_with("int") {
        let n = match param {
            serde_json::Value::Number(n) => {
                U256::from(n.as_u64().ok_or_else(|| bad(format!("cannot encode {param} as {ty}")))?)
            }
            serde_json::Value::String(s) => {
                let s = s.trim();
                if let Some(hex_str) = s.strip_prefix("0x") {
                    U256::from_str_radix(hex_str, 16)
                } else {
                    U256::from_str_radix(s, 10)
                }
                .map_err(|_| bad(format!("cannot encode '{s}' as {ty}")))?
            }
            other => return Err(bad(format!("cannot encode {other} as {ty}"))),
        };
        word.copy_from_slice(&n.to_be_bytes::<32>());
        return Ok(word);
    }
    if let Some(hex_str) = param.as_str().and_then(|s| s.strip_prefix("0x")) {
        // bytes32 and friends, passed pre-encoded
        let bytes = hex::decode(hex_str)
            .map_err(|_| bad(format!("cannot encode {param} as {ty}")))?;
        if bytes.len() > 32 {
            return Err(bad(format!("{ty} value longer than one word")));
        }
        word[..bytes.len()].copy_from_slice(&bytes);
        return Ok(word);
    }
    Err(bad(format!("unsupported argument type {ty}")))
}

fn decode_words(types: &[String], data: &[u8]) -> Result<Vec<Value>, LoadError> {
    let mut out = Vec::with_capacity(types.len());
    for (i, ty) in types.iter().enumerate() {
        let start = i * 32;
        let word = data.get(start..start + 32).ok_or_else(|| {
            LoadError::Payload(format!("return data truncated at word {i} for {ty}"))
        })?;
        if ty == "string" || ty == "bytes" {
            out.push(decode_dynamic(ty, word, data)?);
        } else {
            out.push(decode_word(ty, word)?);
        }
    }
    Ok(out)
}

fn decode_word(ty: &str, word: &[u8]) -> Result<Value, LoadError> {
    let bad = || LoadError::Payload(format!("cannot decode word as {ty}"));
    if word.len() != 32 {
        return Err(bad());
    }

    if ty == "address" {
        return Ok(Value::Str(
            Address::from_slice(&word[12..]).to_checksum(None),
        ));
    }
    if ty == "bool" {
        return Ok(Value::Bool(word[31] != 0));
    }
    if ty.starts_with("uint") {
        let n = U256::from_be_slice(word);
        return Ok(match u64::try_from(n) {
            Ok(v) => Value::UInt(v),
            // magnitudes beyond u64 stay textual; transformers divide them down
            Err(_) => Value::Str(n.to_string()),
        });
    }
    if ty.starts_with("int") {
        let n = U256::from_be_slice(word);
        let negative = word[0] & 0x80 != 0;
        if negative {
            let magnitude = (!n).wrapping_add(U256::from(1));
            return Ok(match u64::try_from(magnitude) {
                Ok(v) if v <= i64::MAX as u64 => Value::Int(-(v as i64)),
                _ => Value::Str(format!("-{magnitude}")),
            });
        }
        return Ok(match u64::try_from(n) {
            Ok(v) => Value::UInt(v),
            Err(_) => Value::Str(n.to_string()),
        });
    }
    if ty.starts_with("bytes") {
        return Ok(Value::Bytes(word.to_vec()));
    }
    Err(bad())
}

fn decode_dynamic(ty: &str, offset_word: &[u8], data: &[u8]) -> Result<Value, LoadError> {
    let bad = || LoadError::Payload(format!("cannot decode dynamic {ty}"));
    let offset = usize::try_from(U256::from_be_slice(offset_word)).map_err(|_| bad())?;
    let len_word = data.get(offset..offset + 32).ok_or_else(bad)?;
    let len = usize::try_from(U256::from_be_slice(len_word)).map_err(|_| bad())?;
    let bytes = data.get(offset + 32..offset + 32 + len).ok_or_else(bad)?;
    if ty == "string" {
        Ok(Value::Str(
            String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string(),
        ))
    } else {
        Ok(Value::Bytes(bytes.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn method_signature_parses() {
        let sig = MethodSig::parse("balanceOf(address)(uint256)").unwrap();
        assert_eq!(sig.name, "balanceOf");
        assert_eq!(sig.inputs, vec!["address"]);
        assert_eq!(sig.outputs, vec!["uint256"]);
        assert_eq!(sig.canonical(), "balanceOf(address)");
    }

    #[test]
    fn selector_matches_known_value() {
        // totalSupply() -> 0x18160ddd
        let sig = MethodSig::parse("totalSupply()(uint256)").unwrap();
        assert_eq!(sig.selector(), [0x18, 0x16, 0x0d, 0xdd]);
    }

    #[test]
    fn encodes_address_argument() {
        let sig = MethodSig::parse("balanceOf(address)(uint256)").unwrap();
        let data = sig
            .encode_call(&[serde_json::json!(
                "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"
            )])
            .unwrap();
        assert_eq!(data.len(), 4 + 32);
        // selector for balanceOf(address) is 0x70a08231
        assert_eq!(&data[..4], &[0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(&data[4..16], &[0u8; 12]);
    }

    #[test]
    fn decodes_uint_and_bool_tuple() {
        let sig = MethodSig::parse("probe()(uint256,bool)").unwrap();
        let mut data = vec![0u8; 64];
        data[31] = 42;
        data[63] = 1;
        assert_eq!(
            sig.decode_output(&data).unwrap(),
            vec![Value::UInt(42), Value::Bool(true)]
        );
    }

    #[test]
    fn large_uints_stay_textual() {
        let sig = MethodSig::parse("probe()(uint256)").unwrap();
        let mut data = vec![0u8; 32];
        data[0] = 1; // 2^248
        match &sig.decode_output(&data).unwrap()[0] {
            Value::Str(s) => assert!(s.starts_with("452312848583266388")),
            other => panic!("expected textual, got {other:?}"),
        }
    }

    #[test]
    fn event_topic0_matches_known_value() {
        let sig =
            EventSig::parse("Transfer(address indexed from, address indexed to, uint256 value)")
                .unwrap();
        assert_eq!(sig.canonical(), "Transfer(address,address,uint256)");
        assert_eq!(
            hex::encode(sig.topic0()),
            "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn decodes_log_in_declaration_order() {
        let sig =
            EventSig::parse("Transfer(address indexed from, address indexed to, uint256 value)")
                .unwrap();
        let mut from = [0u8; 32];
        from[31] = 0xaa;
        let mut to = [0u8; 32];
        to[31] = 0xbb;
        let topics = vec![sig.topic0(), B256::from(from), B256::from(to)];
        let mut data = vec![0u8; 32];
        data[31] = 7;

        let decoded = sig.decode_log(&topics, &data).unwrap();
        assert_eq!(decoded.len(), 3);
        match (&decoded[0], &decoded[1], &decoded[2]) {
            (Value::Str(a), Value::Str(b), Value::UInt(7)) => {
                assert!(a.to_lowercase().ends_with("aa"));
                assert!(b.to_lowercase().ends_with("bb"));
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn decodes_dynamic_string() {
        let sig = MethodSig::parse("symbol()(string)").unwrap();
        let mut data = vec![0u8; 96];
        data[31] = 32; // offset
        data[63] = 4; // length
        data[64..68].copy_from_slice(b"USDC");
        assert_eq!(
            sig.decode_output(&data).unwrap(),
            vec![Value::Str("USDC".into())]
        );
    }
}
