//! Record and proxy sources
//!
//! The runner only needs an indexed list of lines plus a count. Both
//! sources can come from a text file or from lines handed over by the host.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tracing::{info, warn};

use crate::domain::proxy::{ProxyEndpoint, ProxyProtocol};

/// In-memory record lines
#[derive(Debug, Clone, Default)]
pub struct DataPool {
    name: String,
    lines: Arc<Vec<String>>,
}

impl DataPool {
    /// Lines as given; empty lines are dropped
    #[must_use]
    pub fn from_lines<I, S>(name: impl Into<String>, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lines = lines
            .into_iter()
            .map(Into::into)
            .filter(|line: &String| !line.trim().is_empty())
            .collect();
        Self {
            name: name.into(),
            lines: Arc::new(lines),
        }
    }

    pub async fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await?;
        let pool = Self::from_lines(
            path.display().to_string(),
            content.lines().map(|line| line.trim_end_matches('\r')),
        );
        info!("📁 Loaded {} records from {:?}", pool.len(), path);
        Ok(pool)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }
}

/// Where proxies come from, kept so they can be re-read on reload
#[derive(Debug, Clone)]
pub enum ProxySource {
    File {
        path: PathBuf,
        default_protocol: ProxyProtocol,
    },
    Lines {
        lines: Vec<String>,
        default_protocol: ProxyProtocol,
    },
}

impl ProxySource {
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File {
            path: path.into(),
            default_protocol: ProxyProtocol::Http,
        }
    }

    #[must_use]
    pub fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Lines {
            lines: lines.into_iter().map(Into::into).collect(),
            default_protocol: ProxyProtocol::Http,
        }
    }

    #[must_use]
    pub fn with_default_protocol(self, protocol: ProxyProtocol) -> Self {
        match self {
            Self::File { path, .. } => Self::File {
                path,
                default_protocol: protocol,
            },
            Self::Lines { lines, .. } => Self::Lines {
                lines,
                default_protocol: protocol,
            },
        }
    }

    /// Parses every line; malformed lines are skipped with a warning
    pub async fn load(&self) -> std::io::Result<Vec<ProxyEndpoint>> {
        let (content, default_protocol) = match self {
            Self::File {
                path,
                default_protocol,
            } => (fs::read_to_string(path).await?, *default_protocol),
            Self::Lines {
                lines,
                default_protocol,
            } => (lines.join("\n"), *default_protocol),
        };

        let proxies: Vec<ProxyEndpoint> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| match ProxyEndpoint::parse_with_protocol(line, default_protocol) {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    warn!("⚠️ Skipping proxy line '{}': {}", line, e);
                    None
                }
            })
            .collect();
        Ok(proxies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn data_pool_reads_non_empty_lines() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "u1:p1\r\n\nu2:p2\n").unwrap();

        let pool = DataPool::from_file(file.path()).await.unwrap();

        assert_eq!(pool.iter().collect::<Vec<_>>(), vec!["u1:p1", "u2:p2"]);
    }

    #[tokio::test]
    async fn proxy_source_skips_comments_and_garbage() {
        let source = ProxySource::lines(["# list", "1.1.1.1:80", "garbage", "(socks5)2.2.2.2:1080"])
            .with_default_protocol(ProxyProtocol::Socks4);

        let proxies = source.load().await.unwrap();

        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[0].protocol, ProxyProtocol::Socks4);
        assert_eq!(proxies[1].protocol, ProxyProtocol::Socks5);
    }
}
