//! Infrastructure layer for configuration, logging, HTTP and file I/O
//!
//! Everything here touches the outside world: the config file, log files,
//! the network, data/proxy/hit files, and the traits for services that live
//! outside this crate.

pub mod config; // Layered configuration
pub mod hit_store; // JSON lines hit persistence
pub mod http_client; // Proxy-aware HTTP transport with rate limiting
pub mod logging; // Logging infrastructure
pub mod services; // Captcha, browser and socket service traits
pub mod sources; // Record and proxy sources

pub use config::{AppConfig, ConfigManager, GeneralConfig, LoggingConfig, ProxyConfig};
pub use hit_store::JsonlHitStore;
pub use http_client::{HttpConfig, HttpTransport, TransportError, TransportRequest, TransportResponse};
pub use logging::init_logging_with_config;
pub use services::{BrowserSession, CaptchaSolver, ServiceError, SessionHandles, SocketSession};
pub use sources::{DataPool, ProxySource};
