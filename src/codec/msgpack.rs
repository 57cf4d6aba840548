//! MsgPack codec using `rmp-serde`.
//!
//! Structs are always encoded with `to_vec_named` (struct-as-map), so a body
//! decodes the same way whether the peer reads it positionally or by name.

use bytes::Bytes;

use crate::error::Result;

/// MessagePack codec for message bodies.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Encode a value straight into a message body.
    #[inline]
    pub fn encode_bytes<T: serde::Serialize + ?Sized>(value: &T) -> Result<Bytes> {
        Self::encode(value).map(Bytes::from)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct FileRequest {
        path: String,
        max_bytes: u32,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = FileRequest {
            path: "/etc/hostname".to_string(),
            max_bytes: 1024,
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: FileRequest = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_struct_encoded_as_map() {
        let encoded = MsgPackCodec::encode(&FileRequest {
            path: "x".to_string(),
            max_bytes: 0,
        })
        .unwrap();

        // fixmap with 2 entries, not fixarray
        assert_eq!(encoded[0], 0x82);
    }

    #[test]
    fn test_tuple_arguments() {
        let body = MsgPackCodec::encode_bytes(&(vec![1i32, 2, 3], "sum")).unwrap();
        let (ints, label): (Vec<i32>, String) = MsgPackCodec::decode(&body).unwrap();
        assert_eq!(ints, vec![1, 2, 3]);
        assert_eq!(label, "sum");
    }

    #[test]
    fn test_unit_body() {
        let body = MsgPackCodec::encode_bytes(&()).unwrap();
        let _: () = MsgPackCodec::decode(&body).unwrap();
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let result: Result<FileRequest> = MsgPackCodec::decode(b"not valid msgpack");
        assert!(result.is_err());
    }
}
