use aes::Aes128;
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use ecb::cipher::block_padding::Pkcs7;
use ecb::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use rsa::pkcs8::EncodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use serde_json::Value;

type Aes128EcbEnc = ecb::Encryptor<Aes128>;
type Aes128EcbDec = ecb::Decryptor<Aes128>;

const AES_KEY_LEN: usize = 16;

/// The wire envelope for a v1 payload: `{"version":1,"key":..,"conn_info":..}`.
#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct Envelope {
    version: u32,
    key: String,
    conn_info: String,
}

/// Generates the Response Manager's keypair. 1024 bits matches the wire format this
/// implementation interoperates with; it is not meant to resist a modern adversary and the
/// payload it protects (loopback-reachable connection ports) is short-lived.
pub fn generate_keypair() -> Result<(RsaPrivateKey, RsaPublicKey)> {
    let mut rng = rand::thread_rng();
    let priv_key = RsaPrivateKey::new(&mut rng, 1024).context("generating response manager RSA keypair")?;
    let pub_key = RsaPublicKey::from(&priv_key);
    Ok((priv_key, pub_key))
}

/// PEM body with header/footer and newlines stripped, as handed to launchers via
/// `{public_key}` argv substitution.
pub fn public_key_b64(pub_key: &RsaPublicKey) -> Result<String> {
    let pem = pub_key.to_public_key_pem(rsa::pkcs8::LineEnding::LF).context("encoding public key as PEM")?;
    Ok(pem
        .lines()
        .filter(|l| !l.starts_with("-----"))
        .collect::<Vec<_>>()
        .join(""))
}

fn aes_ecb_decrypt(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let mut buf = ciphertext.to_vec();
    let pt = Aes128EcbDec::new(key.into())
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|e| anyhow!("aes-ecb decrypt/unpad failed: {e}"))?;
    Ok(pt.to_vec())
}

fn aes_ecb_encrypt(key: &[u8], plaintext: &[u8]) -> Vec<u8> {
    Aes128EcbEnc::new(key.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Builds a v1 wire payload: outer base64 of `{version, key, conn_info}`, matching §3.
pub fn encode_v1(pub_key: &RsaPublicKey, aes_key: &[u8; AES_KEY_LEN], conn_info_json: &Value) -> Result<Vec<u8>> {
    let mut rng = rand::thread_rng();
    let enc_key = pub_key
        .encrypt(&mut rng, Pkcs1v15Encrypt, aes_key.as_slice())
        .context("rsa-encrypting aes key")?;
    let conn_info_bytes = serde_json::to_vec(conn_info_json)?;
    let enc_conn_info = aes_ecb_encrypt(aes_key, &conn_info_bytes);
    let envelope = Envelope { version: 1, key: B64.encode(enc_key), conn_info: B64.encode(enc_conn_info) };
    let outer = serde_json::to_vec(&envelope)?;
    Ok(B64.encode(outer).into_bytes())
}

/// Attempts the v1 decode path: base64-decode outer envelope, require `version==1`,
/// RSA-decrypt the AES key, AES-ECB-decrypt + PKCS7-unpad `conn_info`, parse as JSON.
/// Returns `Ok(None)` (not an error) when the outer bytes don't parse as a v1 envelope at
/// all, so the caller can fall back to the legacy v0 path.
pub fn try_decode_v1(priv_key: &RsaPrivateKey, outer_b64: &[u8]) -> Result<Option<Value>> {
    let outer = match B64.decode(outer_b64) {
        Ok(b) => b,
        Err(_) => return Ok(None),
    };
    let envelope: Envelope = match serde_json::from_slice(&outer) {
        Ok(e) => e,
        Err(_) => return Ok(None),
    };
    if envelope.version != 1 {
        return Ok(None);
    }
    let enc_key = B64.decode(envelope.key).context("base64-decoding envelope key")?;
    let aes_key = priv_key
        .decrypt(Pkcs1v15Encrypt, &enc_key)
        .map_err(|e| anyhow!("rsa-decrypting aes key failed: {e}"))?;
    if aes_key.len() != AES_KEY_LEN {
        return Err(anyhow!("decrypted aes key has unexpected length {}", aes_key.len()));
    }
    let enc_conn_info = B64.decode(envelope.conn_info).context("base64-decoding envelope conn_info")?;
    let plain = aes_ecb_decrypt(&aes_key, &enc_conn_info)?;
    let value: Value = serde_json::from_slice(&plain).context("parsing decrypted conn_info as json")?;
    Ok(Some(value))
}

/// Legacy v0 fallback: the AES key is the first 16 bytes of a *registered kernel_id*
/// (padded with zero bytes if shorter), used directly against the outer base64 payload
/// with no JSON envelope at all. Accepts a decode only when unpadding succeeds and the
/// resulting text ends in `}` (the original's non-standard but explicit heuristic).
pub fn try_decode_v0_with_kernel_id(outer_b64: &[u8], kernel_id: &str) -> Option<Value> {
    let outer = B64.decode(outer_b64).ok()?;
    let mut key = [0u8; AES_KEY_LEN];
    let id_bytes = kernel_id.as_bytes();
    let n = id_bytes.len().min(AES_KEY_LEN);
    key[..n].copy_from_slice(&id_bytes[..n]);
    let plain = aes_ecb_decrypt(&key, &outer).ok()?;
    let text = std::str::from_utf8(&plain).ok()?;
    if !text.trim_end().ends_with('}') {
        return None;
    }
    serde_json::from_str(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn v1_round_trips() {
        let (priv_key, pub_key) = generate_keypair().unwrap();
        let aes_key = *b"0123456789abcdef";
        let conn_info = json!({"shell_port": 1, "kernel_id": "k1"});
        let wire = encode_v1(&pub_key, &aes_key, &conn_info).unwrap();
        let decoded = try_decode_v1(&priv_key, &wire).unwrap().unwrap();
        assert_eq!(decoded, conn_info);
    }

    #[test]
    fn v1_decode_rejects_garbage_as_fallback_signal() {
        let (priv_key, _pub_key) = generate_keypair().unwrap();
        let decoded = try_decode_v1(&priv_key, b"not-base64-json-at-all!!").unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn v0_legacy_round_trips_via_kernel_id_key() {
        let kernel_id = "abcdefabcdefabcd0123456789";
        let conn_info = json!({"shell_port": 2});
        let mut key = [0u8; AES_KEY_LEN];
        key.copy_from_slice(&kernel_id.as_bytes()[..AES_KEY_LEN]);
        let plain = serde_json::to_vec(&conn_info).unwrap();
        let cipher = aes_ecb_encrypt(&key, &plain);
        let wire = B64.encode(cipher).into_bytes();
        let decoded = try_decode_v0_with_kernel_id(&wire, kernel_id).unwrap();
        assert_eq!(decoded, conn_info);
    }

    #[test]
    fn v0_legacy_rejects_wrong_registrant_key() {
        let kernel_id = "abcdefabcdefabcd0123456789";
        let wrong_id = "zzzzzzzzzzzzzzzzzzzzzzzzzz";
        let conn_info = json!({"shell_port": 2});
        let mut key = [0u8; AES_KEY_LEN];
        key.copy_from_slice(&kernel_id.as_bytes()[..AES_KEY_LEN]);
        let plain = serde_json::to_vec(&conn_info).unwrap();
        let cipher = aes_ecb_encrypt(&key, &plain);
        let wire = B64.encode(cipher).into_bytes();
        assert!(try_decode_v0_with_kernel_id(&wire, wrong_id).is_none());
    }
}
