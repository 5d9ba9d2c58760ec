//! SCRAM-SHA-256 authentication (RFC 5802 / RFC 7677).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Client side of a SCRAM-SHA-256 exchange.
///
/// Channel binding is not used: the gs2 header is always `n,,`.
pub struct ScramClient {
    password: String,
    client_nonce: String,
    client_first_bare: String,
    /// Auth message assembled after the server's first message.
    auth_message: Option<String>,
    salted_password: Option<[u8; 32]>,
}

impl ScramClient {
    pub fn new(password: &str) -> Self {
        let nonce_bytes: [u8; 20] = rand::thread_rng().gen();
        Self::with_nonce(password, &BASE64.encode(nonce_bytes))
    }

    /// Deterministic construction for tests.
    fn with_nonce(password: &str, nonce: &str) -> Self {
        Self {
            password: password.to_string(),
            client_nonce: nonce.to_string(),
            // The name is not sent: PostgreSQL takes it from the startup
            // message, so `n=*` suffices.
            client_first_bare: format!("n=*,r={nonce}"),
            auth_message: None,
            salted_password: None,
        }
    }

    /// `gs2-header || client-first-message-bare`, the payload of
    /// SASLInitialResponse.
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare).into_bytes()
    }

    /// Consume the server-first-message (`r=...,s=...,i=...`) and produce the
    /// client-final-message carrying the proof.
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>> {
        let server_first = std::str::from_utf8(server_msg)
            .map_err(|_| Error::Auth("server sent a non-UTF-8 SCRAM challenge".into()))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(v) = part.strip_prefix("r=") {
                nonce = Some(v.to_string());
            } else if let Some(v) = part.strip_prefix("s=") {
                salt = Some(
                    BASE64
                        .decode(v)
                        .map_err(|_| Error::Auth("invalid SCRAM salt encoding".into()))?,
                );
            } else if let Some(v) = part.strip_prefix("i=") {
                iterations = Some(
                    v.parse::<u32>()
                        .map_err(|_| Error::Auth("invalid SCRAM iteration count".into()))?,
                );
            }
        }
        let combined_nonce = nonce.ok_or_else(|| Error::Auth("missing SCRAM nonce".into()))?;
        let salt = salt.ok_or_else(|| Error::Auth("missing SCRAM salt".into()))?;
        let iterations =
            iterations.ok_or_else(|| Error::Auth("missing SCRAM iteration count".into()))?;

        // The combined nonce must extend ours, or someone is in the middle.
        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(Error::Auth("server nonce does not extend client nonce".into()));
        }

        let salted_password = hi(&self.password, &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);

        let client_final_without_proof = format!("c=biws,r={combined_nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let mut client_proof = [0u8; 32];
        for i in 0..32 {
            client_proof[i] = client_key[i] ^ client_signature[i];
        }

        self.auth_message = Some(auth_message);
        self.salted_password = Some(salted_password);

        Ok(format!(
            "{client_final_without_proof},p={}",
            BASE64.encode(client_proof)
        )
        .into_bytes())
    }

    /// Verify the server signature in the final message (`v=...`).
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<()> {
        let server_final = std::str::from_utf8(server_msg)
            .map_err(|_| Error::Auth("server sent a non-UTF-8 SCRAM verifier".into()))?;
        let verifier = server_final
            .strip_prefix("v=")
            .ok_or_else(|| Error::Auth("missing SCRAM server signature".into()))?;
        let server_signature = BASE64
            .decode(verifier)
            .map_err(|_| Error::Auth("invalid SCRAM server signature encoding".into()))?;

        let salted_password = self
            .salted_password
            .ok_or_else(|| Error::Auth("SCRAM verification before challenge".into()))?;
        let auth_message = self
            .auth_message
            .as_ref()
            .ok_or_else(|| Error::Auth("SCRAM verification before challenge".into()))?;

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        let expected = hmac_sha256(&server_key, auth_message.as_bytes());
        if server_signature != expected {
            return Err(Error::Auth("server signature verification failed".into()));
        }
        Ok(())
    }
}

/// Hi(): PBKDF2 with HMAC-SHA-256.
fn hi(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .expect("valid output length");
    output
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_shape() {
        let mut client = ScramClient::new("pencil");

        let first = String::from_utf8(client.client_first_message()).unwrap();
        assert!(first.starts_with("n,,n=*,r="));

        let client_nonce = first.strip_prefix("n,,n=*,r=").unwrap();
        let server_first = format!(
            "r={client_nonce}EXTRA,s={},i=4096",
            BASE64.encode(b"salt1234salt1234")
        );
        let final_msg =
            String::from_utf8(client.process_server_first(server_first.as_bytes()).unwrap())
                .unwrap();
        assert!(final_msg.starts_with(&format!("c=biws,r={client_nonce}EXTRA,p=")));
    }

    #[test]
    fn rejects_foreign_nonce() {
        let mut client = ScramClient::with_nonce("pw", "clientnonce");
        let server_first = format!("r=othernonce,s={},i=4096", BASE64.encode(b"salt"));
        let err = client
            .process_server_first(server_first.as_bytes())
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn rfc7677_vector() {
        // Test vector from RFC 7677 section 3.
        let mut client =
            ScramClient::with_nonce("pencil", "rOprNGfwEbeRWgbNEkqO");
        // The RFC's client-first uses n=user; PostgreSQL sends n=*, so splice
        // the RFC bare string in for the vector check.
        client.client_first_bare = "n=user,r=rOprNGfwEbeRWgbNEkqO".to_string();

        let server_first = b"r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
        let final_msg =
            String::from_utf8(client.process_server_first(server_first).unwrap()).unwrap();
        assert_eq!(
            final_msg,
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );

        client
            .verify_server_final(b"v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")
            .unwrap();
        assert!(client.verify_server_final(b"v=AAAA").is_err());
    }
}
