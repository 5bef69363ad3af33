//! 远程数据源：只要求支持按字节范围读取和探测文件大小

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use regex::Regex;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::pin::Pin;
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

use crate::config::Config;
use crate::core::error::DownloadError;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, DownloadError>> + Send>>;

#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// 用于日志与状态展示的地址
    fn location(&self) -> &str;

    /// 探测远程文件大小，未知时返回 0
    async fn probe_size(&self) -> Result<u64, DownloadError>;

    /// 读取 `[start, end)` 范围的数据
    async fn read_range(&self, start: u64, end: u64) -> Result<ByteStream, DownloadError>;
}

/// 基于 HTTP Range 请求的数据源
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    url: String,
}

fn content_range_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^bytes\s+\d+-\d+/(\d+)$").expect("content-range pattern is valid")
    })
}

/// 从 `Content-Range: bytes 0-0/12345` 中取出总大小
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    content_range_pattern()
        .captures(value.trim())
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

impl HttpSource {
    pub fn new(url: &str, config: &Config) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| DownloadError::Config(format!("无法创建HTTP客户端: {}", e)))?;
        Self::with_client(client, url)
    }

    pub fn with_client(client: Client, url: &str) -> Result<Self, DownloadError> {
        let parsed = Url::parse(url)
            .map_err(|e| DownloadError::Validation(format!("无效的URL {}: {}", url, e)))?;
        if !["http", "https"].contains(&parsed.scheme()) {
            return Err(DownloadError::Validation(format!("只支持 HTTP 和 HTTPS 协议: {}", url)));
        }
        Ok(Self { client, url: url.to_string() })
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    fn location(&self) -> &str {
        &self.url
    }

    async fn probe_size(&self) -> Result<u64, DownloadError> {
        let response = self.client.get(&self.url).header(RANGE, "bytes=0-0").send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::from_status(status));
        }
        if status == StatusCode::PARTIAL_CONTENT {
            // 206 的 Content-Length 只是探测的那一个字节，总大小只能从 Content-Range 取
            let total = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total);
            return Ok(total.unwrap_or(0));
        }
        Ok(response.content_length().unwrap_or(0))
    }

    async fn read_range(&self, start: u64, end: u64) -> Result<ByteStream, DownloadError> {
        let range = format!("bytes={}-{}", start, end.saturating_sub(1));
        let response = self.client.get(&self.url).header(RANGE, range).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::from_status(status));
        }
        if status != StatusCode::PARTIAL_CONTENT && start > 0 {
            return Err(DownloadError::FatalRemote("服务器不支持分段下载".to_string()));
        }
        Ok(Box::pin(response.bytes_stream().map(|item| item.map_err(DownloadError::from))))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// 按请求的 Range 头返回对应的切片
    struct RangeResponder(Vec<u8>);

    impl Respond for RangeResponder {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let range = request
                .headers
                .get("range")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("bytes="))
                .and_then(|v| v.split_once('-'))
                .and_then(|(start, end)| Some((start.parse::<usize>().ok()?, end.parse::<usize>().ok()?)));
            match range {
                Some((start, end)) => ResponseTemplate::new(206)
                    .insert_header("Content-Range", format!("bytes {}-{}/{}", start, end, self.0.len()))
                    .set_body_bytes(self.0[start..=end].to_vec()),
                None => ResponseTemplate::new(200).set_body_bytes(self.0.clone()),
            }
        }
    }

    async fn server_with(response: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET")).respond_with(response).mount(&server).await;
        server
    }

    fn source(url: &str) -> HttpSource {
        let client = Client::builder().no_proxy().build().unwrap();
        HttpSource::with_client(client, url).unwrap()
    }

    async fn collect(mut stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(piece) = stream.next().await {
            out.extend_from_slice(&piece.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_probe_size_from_content_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=0-0"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-0/5000")
                    .set_body_bytes(vec![0u8]),
            )
            .mount(&server)
            .await;
        assert_eq!(source(&server.uri()).probe_size().await.unwrap(), 5000);
    }

    #[tokio::test]
    async fn test_probe_size_unknown_total_is_zero() {
        let server = server_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 0-0/*")
                .set_body_bytes(vec![0u8]),
        ).await;
        assert_eq!(source(&server.uri()).probe_size().await.unwrap(), 0);

        let server = server_with(ResponseTemplate::new(206).set_body_bytes(vec![0u8])).await;
        assert_eq!(source(&server.uri()).probe_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_probe_size_without_range_support() {
        let server = server_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 300])).await;
        assert_eq!(source(&server.uri()).probe_size().await.unwrap(), 300);
    }

    #[tokio::test]
    async fn test_probe_size_error_status() {
        let server = server_with(ResponseTemplate::new(404)).await;
        assert!(matches!(source(&server.uri()).probe_size().await, Err(DownloadError::FatalRemote(_))));

        let server = server_with(ResponseTemplate::new(503)).await;
        assert!(matches!(source(&server.uri()).probe_size().await, Err(DownloadError::TransientNetwork(_))));
    }

    #[tokio::test]
    async fn test_read_range_returns_requested_bytes() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(RangeResponder(data.clone()))
            .mount(&server)
            .await;

        let http = source(&server.uri());
        assert_eq!(http.probe_size().await.unwrap(), 1000);
        let stream = http.read_range(100, 300).await.unwrap();
        assert_eq!(collect(stream).await, &data[100..300]);
    }

    #[tokio::test]
    async fn test_read_range_status_handling() {
        // 服务器忽略 Range 时只有从 0 开始的分块还能用
        let server = server_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 64])).await;
        let http = source(&server.uri());
        assert_eq!(collect(http.read_range(0, 64).await.unwrap()).await.len(), 64);
        assert!(matches!(http.read_range(32, 64).await, Err(DownloadError::FatalRemote(_))));

        let server = server_with(ResponseTemplate::new(403)).await;
        assert!(matches!(source(&server.uri()).read_range(0, 10).await, Err(DownloadError::FatalRemote(_))));

        let server = server_with(ResponseTemplate::new(502)).await;
        assert!(matches!(source(&server.uri()).read_range(0, 10).await, Err(DownloadError::TransientNetwork(_))));
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range_total("bytes 0-0/1000000"), Some(1_000_000));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_http_source_rejects_other_schemes() {
        let config = Config::default();
        assert!(HttpSource::new("https://example.com/file.zip", &config).is_ok());
        assert!(matches!(
            HttpSource::new("ftp://example.com/file.zip", &config),
            Err(DownloadError::Validation(_))
        ));
        assert!(HttpSource::new("not a url", &config).is_err());
    }
}
