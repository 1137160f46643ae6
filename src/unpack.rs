//! Batch unpacker: `docZip` payload to raw XML.
//!
//! Each entry is base64 over a gzip stream. Entries are independent, so a
//! failure here is reported per entry and the rest of the batch goes on.

use std::io::Read;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};

use crate::error::{SyncError, SyncResult};
use crate::models::Nsu;
use crate::protocol::DocZip;

/// Upper bound on a single inflated document.
const MAX_DOCUMENT_BYTES: u64 = 16 * 1024 * 1024;

/// A decoded entry, tagged with its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedDoc {
    pub nsu: Nsu,
    pub schema: String,
    pub xml: String,
}

pub fn unpack(entry: &DocZip) -> SyncResult<UnpackedDoc> {
    let compressed = decode_base64(&entry.payload)
        .map_err(|e| SyncError::Decode(format!("NSU {}: {}", entry.nsu, e)))?;
    let bytes = inflate(&compressed)
        .map_err(|e| SyncError::Decode(format!("NSU {}: {}", entry.nsu, e)))?;
    let xml = String::from_utf8(bytes)
        .map_err(|e| SyncError::Decode(format!("NSU {}: not UTF-8: {}", entry.nsu, e)))?;

    Ok(UnpackedDoc {
        nsu: entry.nsu,
        schema: entry.schema.clone(),
        xml,
    })
}

fn decode_base64(payload: &str) -> Result<Vec<u8>, String> {
    let cleaned: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if cleaned.is_empty() {
        return Err("empty payload".to_string());
    }
    STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|e| format!("invalid base64: {}", e))
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, String> {
    if data.starts_with(&[0x1f, 0x8b]) {
        return read_bounded(GzDecoder::new(data)).map_err(|e| format!("invalid gzip: {}", e));
    }
    // Some emitters send zlib or raw deflate instead of gzip
    read_bounded(ZlibDecoder::new(data))
        .or_else(|_| read_bounded(DeflateDecoder::new(data)))
        .map_err(|e| format!("invalid deflate stream: {}", e))
}

fn read_bounded<R: Read>(reader: R) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let n = reader.take(MAX_DOCUMENT_BYTES + 1).read_to_end(&mut out)?;
    if n as u64 > MAX_DOCUMENT_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "document exceeds size limit",
        ));
    }
    if out.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "empty document",
        ));
    }
    Ok(out)
}

/// Gzip and base64-encode an XML body, the way the service ships it.
pub fn pack(xml: &str) -> String {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail
    let _ = enc.write_all(xml.as_bytes());
    let gz = enc.finish().unwrap_or_default();
    STANDARD.encode(gz)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(payload: String) -> DocZip {
        DocZip {
            nsu: Nsu::new(7),
            schema: "resNFe_v1.01.xsd".into(),
            payload,
        }
    }

    #[test]
    fn unpacks_gzip_base64() {
        let doc = unpack(&entry(pack("<resNFe><chNFe>1</chNFe></resNFe>"))).unwrap();
        assert_eq!(doc.nsu, Nsu::new(7));
        assert_eq!(doc.xml, "<resNFe><chNFe>1</chNFe></resNFe>");
    }

    #[test]
    fn tolerates_line_breaks_in_base64() {
        let packed = pack("<resNFe/>");
        let (a, b) = packed.split_at(packed.len() / 2);
        let doc = unpack(&entry(format!("{}\n  {}", a, b))).unwrap();
        assert_eq!(doc.xml, "<resNFe/>");
    }

    #[test]
    fn accepts_zlib() {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"<nfeProc/>").unwrap();
        let payload = STANDARD.encode(enc.finish().unwrap());
        assert_eq!(unpack(&entry(payload)).unwrap().xml, "<nfeProc/>");
    }

    #[test]
    fn corrupt_base64_is_decode_error() {
        let err = unpack(&entry("!!!not base64!!!".into())).unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
        assert!(err.to_string().contains("000000000000007"));
    }

    #[test]
    fn valid_base64_but_not_compressed_is_decode_error() {
        let err = unpack(&entry(STANDARD.encode(b"plain text, no gzip"))).unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
    }
}
