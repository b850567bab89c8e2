//! Base58check and bech32 address rendering.

use std::fmt;

use bech32::{Fe32, Hrp};

use crate::hash::sha256d;
use crate::network::Network;

const BASE58_ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    InvalidWitnessProgram,
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::InvalidWitnessProgram => write!(f, "invalid witness program"),
        }
    }
}

impl std::error::Error for AddressError {}

pub fn p2pkh_address(hash: &[u8; 20], network: Network) -> String {
    versioned_address(network.pubkey_hash_prefix(), hash)
}

pub fn p2sh_address(hash: &[u8; 20], network: Network) -> String {
    versioned_address(network.script_hash_prefix(), hash)
}

fn versioned_address(version: u8, hash: &[u8; 20]) -> String {
    let mut payload = [0u8; 21];
    payload[0] = version;
    payload[1..].copy_from_slice(hash);
    base58check_encode(&payload)
}

/// Renders a witness program: bech32 for version 0, bech32m above.
pub fn segwit_address(
    version: u8,
    program: &[u8],
    network: Network,
) -> Result<String, AddressError> {
    let hrp = Hrp::parse(network.bech32_hrp()).map_err(|_| AddressError::InvalidWitnessProgram)?;
    let version = Fe32::try_from(version).map_err(|_| AddressError::InvalidWitnessProgram)?;
    bech32::segwit::encode(hrp, version, program).map_err(|_| AddressError::InvalidWitnessProgram)
}

fn base58check_encode(payload: &[u8]) -> String {
    let checksum = sha256d(payload);
    let mut data = Vec::with_capacity(payload.len() + 4);
    data.extend_from_slice(payload);
    data.extend_from_slice(&checksum[..4]);
    base58_encode(&data)
}

fn base58_encode(data: &[u8]) -> String {
    let zeros = data.iter().take_while(|byte| **byte == 0).count();
    // Little-endian base58 digits of the non-zero tail.
    let mut digits: Vec<u8> = Vec::with_capacity(data.len() * 138 / 100 + 1);
    for byte in &data[zeros..] {
        let mut carry = u32::from(*byte);
        for digit in digits.iter_mut() {
            carry += u32::from(*digit) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }
    let mut out = String::with_capacity(zeros + digits.len());
    out.extend(std::iter::repeat('1').take(zeros));
    out.extend(
        digits
            .iter()
            .rev()
            .map(|digit| BASE58_ALPHABET[*digit as usize] as char),
    );
    out
}
