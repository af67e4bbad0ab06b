use aes::cipher::{
  BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7,
};
use provisioner_client::ConnectionInfo;
use rand::RngCore;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey, rand_core::OsRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Bumped whenever the wire shape of [`Envelope`] changes in a
/// backwards-incompatible way. Launchers built against an older
/// version are rejected rather than guessed at.
pub const PAYLOAD_VERSION: u32 = 1;

const AES_KEY_LEN: usize = 16;
const AES_IV_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
  #[error("{0}")]
  Malformed(String),
  #[error("{0}")]
  Failed(String),
  #[error("payload version {found} is not supported (expected {expected})")]
  VersionMismatch { found: u32, expected: u32 },
}

#[derive(Serialize, Deserialize)]
struct Envelope {
  version: u32,
  /// base64(RSA_pub(random 16-byte AES key))
  key: String,
  /// base64(iv || AES_CBC_PKCS7(JSON(ConnectionInfo)))
  conn_info: String,
}

/// Launcher-side: encrypts `conn_info` under `public_key`, returning
/// the base64 blob sent as the sole write on the response connection.
pub fn encrypt_payload(
  conn_info: &ConnectionInfo,
  public_key: &RsaPublicKey,
) -> Result<String, CryptoError> {
  let plaintext = serde_json::to_vec(conn_info)
    .map_err(|e| CryptoError::Malformed(e.to_string()))?;

  let mut aes_key = [0u8; AES_KEY_LEN];
  let mut iv = [0u8; AES_IV_LEN];
  OsRng.fill_bytes(&mut aes_key);
  OsRng.fill_bytes(&mut iv);

  let ciphertext = Aes128CbcEnc::new(&aes_key.into(), &iv.into())
    .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

  let mut framed = Vec::with_capacity(iv.len() + ciphertext.len());
  framed.extend_from_slice(&iv);
  framed.extend_from_slice(&ciphertext);

  let encrypted_key = public_key
    .encrypt(&mut OsRng, Pkcs1v15Encrypt, &aes_key)
    .map_err(|e| CryptoError::Failed(format!("RSA encrypt failed: {e}")))?;

  let envelope = Envelope {
    version: PAYLOAD_VERSION,
    key: data_encoding::BASE64.encode(&encrypted_key),
    conn_info: data_encoding::BASE64.encode(&framed),
  };

  let json = serde_json::to_vec(&envelope)
    .map_err(|e| CryptoError::Malformed(e.to_string()))?;
  Ok(data_encoding::BASE64.encode(&json))
}

/// Response-manager side: reverses [`encrypt_payload`]. `kernel_id`
/// inside the returned [`ConnectionInfo`] is the routing key.
pub fn decrypt_payload(
  blob: &str,
  private_key: &RsaPrivateKey,
) -> Result<ConnectionInfo, CryptoError> {
  let json = data_encoding::BASE64
    .decode(blob.trim().as_bytes())
    .map_err(|e| CryptoError::Malformed(format!("outer base64: {e}")))?;
  let envelope: Envelope = serde_json::from_slice(&json)
    .map_err(|e| CryptoError::Malformed(format!("envelope json: {e}")))?;

  if envelope.version != PAYLOAD_VERSION {
    return Err(CryptoError::VersionMismatch {
      found: envelope.version,
      expected: PAYLOAD_VERSION,
    });
  }

  let encrypted_key = data_encoding::BASE64
    .decode(envelope.key.as_bytes())
    .map_err(|e| CryptoError::Malformed(format!("key base64: {e}")))?;
  let aes_key = private_key
    .decrypt(Pkcs1v15Encrypt, &encrypted_key)
    .map_err(|e| CryptoError::Failed(format!("RSA decrypt failed: {e}")))?;
  if aes_key.len() != AES_KEY_LEN {
    return Err(CryptoError::Failed(
      "decrypted AES key has unexpected length".to_string(),
    ));
  }

  let framed = data_encoding::BASE64
    .decode(envelope.conn_info.as_bytes())
    .map_err(|e| CryptoError::Malformed(format!("conn_info base64: {e}")))?;
  if framed.len() < AES_IV_LEN {
    return Err(CryptoError::Malformed(
      "conn_info ciphertext shorter than one IV".to_string(),
    ));
  }
  let (iv, ciphertext) = framed.split_at(AES_IV_LEN);

  let mut aes_key_arr = [0u8; AES_KEY_LEN];
  aes_key_arr.copy_from_slice(&aes_key);

  let plaintext = Aes128CbcDec::new(&aes_key_arr.into(), iv.into())
    .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
    .map_err(|e| CryptoError::Failed(format!("AES decrypt failed: {e}")))?;

  serde_json::from_slice(&plaintext)
    .map_err(|e| CryptoError::Malformed(format!("conn_info json: {e}")))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::key::ProvisionerKeypair;

  fn sample_conn_info() -> ConnectionInfo {
    ConnectionInfo {
      kernel_id: "abc-123".to_string(),
      ip: "10.0.0.5".to_string(),
      shell_port: 40001,
      iopub_port: 40002,
      stdin_port: 40003,
      control_port: 40004,
      hb_port: 40005,
      signature_key: "sigkey".to_string(),
      signature_scheme: "hmac-sha256".to_string(),
      communication_port: 40006,
      pid: Some(1234),
      pgid: None,
    }
  }

  #[test]
  fn round_trip_is_byte_identical() {
    let keypair = ProvisionerKeypair::generate().unwrap();
    let original = sample_conn_info();
    let blob = encrypt_payload(&original, &keypair.public).unwrap();
    let decrypted = decrypt_payload(&blob, &keypair.private).unwrap();
    assert_eq!(
      serde_json::to_string(&original).unwrap(),
      serde_json::to_string(&decrypted).unwrap()
    );
  }

  #[test]
  fn wrong_private_key_fails_to_decrypt() {
    let keypair_a = ProvisionerKeypair::generate().unwrap();
    let keypair_b = ProvisionerKeypair::generate().unwrap();
    let blob =
      encrypt_payload(&sample_conn_info(), &keypair_a.public).unwrap();
    let err = decrypt_payload(&blob, &keypair_b.private).unwrap_err();
    assert!(matches!(err, CryptoError::Failed(_)));
  }

  #[test]
  fn garbage_blob_is_malformed_not_a_panic() {
    let keypair = ProvisionerKeypair::generate().unwrap();
    let err =
      decrypt_payload("not-base64-json!!", &keypair.private).unwrap_err();
    assert!(matches!(err, CryptoError::Malformed(_)));
  }

  #[test]
  fn future_version_is_rejected() {
    let keypair = ProvisionerKeypair::generate().unwrap();
    let blob =
      encrypt_payload(&sample_conn_info(), &keypair.public).unwrap();
    let json = data_encoding::BASE64.decode(blob.as_bytes()).unwrap();
    let mut envelope: Envelope = serde_json::from_slice(&json).unwrap();
    envelope.version = 99;
    let tampered = data_encoding::BASE64
      .encode(&serde_json::to_vec(&envelope).unwrap());
    let err = decrypt_payload(&tampered, &keypair.private).unwrap_err();
    assert!(matches!(err, CryptoError::VersionMismatch { .. }));
  }
}
