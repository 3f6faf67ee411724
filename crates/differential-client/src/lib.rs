//! Client SDK: HTTP transport, payload codec, results poller and the typed
//! service proxy. The worker agent reuses the transport via [`ControlApi`].

pub mod api;
pub mod codec;
pub mod error;
pub mod poller;
pub mod service;

pub use api::{ApiClientConfig, ControlApi, HttpControlClient};
pub use codec::{Cipher, Codec, EncryptedCodec, EncryptionKeyring, JsonCodec, ENCRYPTION_KEY_LEN};
pub use error::ClientError;
pub use poller::{ResultsPoller, ResultsPollerConfig};
pub use service::ServiceClient;
