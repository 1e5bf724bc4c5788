use base64::Engine;
use rand::Rng;
use rand::distr::{Alphanumeric, SampleString};
use uuid::Uuid;
use warden_shared::Protocol;

/// Protocol credential for one client copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub id: Option<String>,
    pub password: Option<String>,
    pub method: Option<String>,
}

/// Fresh credential for a client in an inbound of `protocol`.
/// Shadowsocks clients inherit the inbound's cipher.
pub fn fresh_credential(protocol: &Protocol, inbound_method: Option<&str>) -> Credential {
    match protocol {
        Protocol::Vmess | Protocol::Vless => Credential {
            id: Some(Uuid::new_v4().to_string()),
            password: None,
            method: None,
        },
        Protocol::Trojan => Credential {
            id: None,
            password: Some(new_password(None)),
            method: None,
        },
        Protocol::Shadowsocks => Credential {
            id: None,
            password: Some(new_password(inbound_method)),
            method: inbound_method.map(str::to_string),
        },
        Protocol::Other(_) => Credential {
            id: None,
            password: None,
            method: None,
        },
    }
}

/// SS-2022 ciphers need a base64 key of the cipher's exact size.
pub fn new_password(method: Option<&str>) -> String {
    match method.and_then(ss2022_key_len) {
        Some(len) => {
            let mut key = vec![0u8; len];
            rand::rng().fill(&mut key[..]);
            base64::engine::general_purpose::STANDARD.encode(key)
        }
        None => Alphanumeric.sample_string(&mut rand::rng(), 16),
    }
}

fn ss2022_key_len(method: &str) -> Option<usize> {
    match method {
        "2022-blake3-aes-128-gcm" => Some(16),
        "2022-blake3-aes-256-gcm" | "2022-blake3-chacha20-poly1305" => Some(32),
        _ => None,
    }
}

/// Subscription ids follow the panel's own format: 16 lowercase alphanumerics.
pub fn new_sub_id() -> String {
    Alphanumeric
        .sample_string(&mut rand::rng(), 16)
        .to_ascii_lowercase()
}
