use std::{fmt, path::Path};

use anyhow::Context;
use rand::rngs::OsRng;
use rsa::{
  RsaPrivateKey, RsaPublicKey,
  pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey,
    EncodePublicKey, LineEnding,
  },
};

const KEY_BITS: usize = 2048;

/// The process-wide asymmetric keypair used to receive kernel
/// connection payloads. Generated once per host process; the public
/// half is handed to every launcher via the `{public_key}` argv
/// placeholder.
pub struct ProvisionerKeypair {
  pub private: RsaPrivateKey,
  pub public: RsaPublicKey,
}

impl ProvisionerKeypair {
  pub fn generate() -> anyhow::Result<Self> {
    let private = RsaPrivateKey::new(&mut OsRng, KEY_BITS)
      .context("failed to generate RSA keypair")?;
    let public = RsaPublicKey::from(&private);
    Ok(Self { private, public })
  }

  pub fn from_private_pem_file(
    path: impl AsRef<Path>,
  ) -> anyhow::Result<Self> {
    let pem = std::fs::read_to_string(path.as_ref()).with_context(
      || format!("failed to read private key at {:?}", path.as_ref()),
    )?;
    let private = RsaPrivateKey::from_pkcs8_pem(&pem)
      .context("failed to parse PKCS8 private key PEM")?;
    let public = RsaPublicKey::from(&private);
    Ok(Self { private, public })
  }

  pub fn write_private_pem(
    &self,
    path: impl AsRef<Path>,
  ) -> anyhow::Result<()> {
    let pem = self
      .private
      .to_pkcs8_pem(LineEnding::LF)
      .context("failed to encode private key as PKCS8 PEM")?;
    std::fs::write(path, pem.as_bytes())
      .context("failed to write private key PEM")
  }

  pub fn public_key_base64(&self) -> anyhow::Result<String> {
    let der = self
      .public
      .to_public_key_der()
      .context("failed to encode public key as SPKI DER")?;
    Ok(data_encoding::BASE64.encode(der.as_bytes()))
  }
}

impl fmt::Debug for ProvisionerKeypair {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ProvisionerKeypair")
      .field("public", &self.public_key_base64().ok())
      .finish()
  }
}

/// Parses a launcher-supplied base64 SPKI DER public key, as received
/// out of band (e.g. a launcher that persists its own keypair rather
/// than trusting the process-wide one).
pub fn parse_public_key_base64(
  encoded: &str,
) -> anyhow::Result<RsaPublicKey> {
  let der = data_encoding::BASE64
    .decode(encoded.as_bytes())
    .context("public key is not valid base64")?;
  RsaPublicKey::from_public_key_der(&der)
    .context("public key is not valid SPKI DER")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn generated_public_key_roundtrips_through_base64() {
    let keypair = ProvisionerKeypair::generate().unwrap();
    let encoded = keypair.public_key_base64().unwrap();
    let parsed = parse_public_key_base64(&encoded).unwrap();
    assert_eq!(parsed, keypair.public);
  }
}
