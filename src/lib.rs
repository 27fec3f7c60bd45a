pub mod buffer;
pub mod config;
pub mod connector;
pub mod error;
pub mod logging;
pub mod message;
pub mod net;
pub mod pool;
pub mod relay;
pub mod tunnel;
pub mod upload;

pub use buffer::{Buffer, ProgressListener};
pub use config::{Config, ConnectorConfig, TunnelConfig};
pub use connector::{HttpProxyConnector, ProxyEndpoint, ProxyType};
pub use error::ProxyError;
pub use message::{HttpRequest, HttpResponse};
pub use relay::RelayState;
pub use tunnel::{NoopHooks, RelayHooks, TunnelServer};
pub use upload::{ByteArrayUploadable, FileUploadable, Uploadable};
