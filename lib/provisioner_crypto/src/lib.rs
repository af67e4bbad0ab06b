pub mod codec;
pub mod key;

pub use codec::{CryptoError, PAYLOAD_VERSION, decrypt_payload, encrypt_payload};
pub use key::{ProvisionerKeypair, parse_public_key_base64};
