//! 索引编码服务
//!
//! 将仓库索引编码为客户端可下载的格式：
//! - JSON（`apiVersion` / `entries` / `generated`）
//! - Gzip 压缩的 JSON
//!
//! 解码时根据 gzip 魔数自动识别是否压缩。

use crate::error::{RepoError, Result};
use crate::repo::RepositoryIndex;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tracing::debug;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Encode the index as pretty-printed JSON
pub fn encode_json(index: &RepositoryIndex) -> Result<Vec<u8>> {
    let encoded = serde_json::to_vec_pretty(index)
        .map_err(|e| RepoError::internal(format!("Index serialization error: {}", e)))?;
    debug!(
        charts = index.chart_count(),
        bytes = encoded.len(),
        "Index encoded as JSON"
    );
    Ok(encoded)
}

/// Encode the index as gzip-compressed JSON
pub fn encode_json_gz(index: &RepositoryIndex) -> Result<Vec<u8>> {
    let json = encode_json(index)?;

    // Gzip 压缩
    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| RepoError::internal(format!("Index compression error: {}", e)))?;
    let compressed = encoder
        .finish()
        .map_err(|e| RepoError::internal(format!("Index compression error: {}", e)))?;

    debug!(
        raw_bytes = json.len(),
        compressed_bytes = compressed.len(),
        "Index compressed"
    );
    Ok(compressed)
}

/// Decode an index produced by [`encode_json`] or [`encode_json_gz`]
pub fn decode_json(data: &[u8]) -> Result<RepositoryIndex> {
    let mut inflated = Vec::new();
    let json: &[u8] = if data.starts_with(&GZIP_MAGIC) {
        GzDecoder::new(data)
            .read_to_end(&mut inflated)
            .map_err(|e| RepoError::malformed("index", format!("invalid gzip stream: {}", e)))?;
        &inflated
    } else {
        // 未压缩
        data
    };

    serde_json::from_slice(json)
        .map_err(|e| RepoError::malformed("index", format!("invalid index JSON: {}", e)))
}
