//! Room codes
//!
//! Cloud rooms are identified by a six-character code drawn from an alphabet
//! without look-alike glyphs. LAN rooms embed the host's IPv4 address and
//! discovery-server port as `L<base36 ip>-<base36 port>`, so a joiner on the
//! same network can reach the host without a broker.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use rand::Rng;

/// Symbols used in cloud room codes (no 0/O, 1/I)
pub const CLOUD_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of a cloud room code
pub const CLOUD_CODE_LEN: usize = 6;

const BASE36_DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Generate a random cloud room code.
///
/// Uniqueness is not guaranteed; the broker rejects a duplicate registration.
pub fn generate_cloud_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CLOUD_CODE_LEN)
        .map(|_| CLOUD_CODE_ALPHABET[rng.gen_range(0..CLOUD_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Check whether a string looks like a cloud room code
pub fn is_cloud_code_format(code: &str) -> bool {
    code.len() == CLOUD_CODE_LEN && code.bytes().all(|b| CLOUD_CODE_ALPHABET.contains(&b))
}

/// Encode an IPv4 address and port as a LAN code.
///
/// `192.168.1.42:9000` becomes `L1HGE14A-6Y0`.
pub fn encode_lan_code(ip: Ipv4Addr, port: u16) -> String {
    format!(
        "L{}-{}",
        to_base36(u64::from(u32::from(ip))),
        to_base36(u64::from(port))
    )
}

/// Decode a LAN code back into its address and port.
///
/// Returns `None` for anything that is not a LAN code; the caller then treats
/// the code as a cloud room.
pub fn decode_lan_code(code: &str) -> Option<(Ipv4Addr, u16)> {
    let rest = code.strip_prefix('L')?;
    let (ip_part, port_part) = rest.split_once('-')?;
    if port_part.contains('-') {
        return None;
    }

    let ip = u32::try_from(from_base36(ip_part)?).ok()?;
    let port = u16::try_from(from_base36(port_part)?).ok()?;
    Some((Ipv4Addr::from(ip), port))
}

fn to_base36(mut num: u64) -> String {
    if num == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while num > 0 {
        digits.push(BASE36_DIGITS[(num % 36) as usize]);
        num /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

fn from_base36(s: &str) -> Option<u64> {
    if s.is_empty() {
        return None;
    }
    s.chars().try_fold(0u64, |acc, c| {
        if !(c.is_ascii_digit() || c.is_ascii_uppercase()) {
            return None;
        }
        let digit = c.to_digit(36)?;
        acc.checked_mul(36)?.checked_add(u64::from(digit))
    })
}

/// A room code, interpreted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkCode {
    /// Broker-addressed room; the code is the host's signaling id
    Cloud(String),
    /// Room hosted on the local network
    Lan(SocketAddrV4),
}

impl NetworkCode {
    /// Interpret a user-supplied code. Never fails: anything that does not
    /// decode as a LAN code is a cloud code. Case-insensitive.
    pub fn parse(code: &str) -> Self {
        let code = code.trim().to_ascii_uppercase();
        match decode_lan_code(&code) {
            Some((ip, port)) => Self::Lan(SocketAddrV4::new(ip, port)),
            None => Self::Cloud(code),
        }
    }
}

impl fmt::Display for NetworkCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cloud(code) => f.write_str(code),
            Self::Lan(addr) => f.write_str(&encode_lan_code(*addr.ip(), addr.port())),
        }
    }
}
