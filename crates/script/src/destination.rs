use utxod_primitives::address::{p2pkh_address, p2sh_address, segwit_address};
use utxod_primitives::hash::hash160;
use utxod_primitives::Network;

use crate::standard::{classify_script_pubkey, multisig_keys, p2pk_key, ScriptType};

/// Where an output pays to, as far as the address index is concerned.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Destination {
    None,
    Single(String),
    /// Participants of a bare multisig script, in script order.
    Multi(Vec<String>),
}

impl Destination {
    /// Key under which the address index records this destination.
    ///
    /// Multisig participants collapse into one comma-joined key that is never split again.
    pub fn index_key(&self) -> Option<String> {
        match self {
            Destination::None => None,
            Destination::Single(address) => Some(address.clone()),
            Destination::Multi(addresses) => Some(addresses.join(",")),
        }
    }
}

/// Best-effort decode; nonstandard scripts yield `Destination::None`.
pub fn extract_destination(script: &[u8], network: Network) -> Destination {
    match classify_script_pubkey(script) {
        ScriptType::P2Pkh => Destination::Single(p2pkh_address(&hash20(&script[3..23]), network)),
        ScriptType::P2Sh => Destination::Single(p2sh_address(&hash20(&script[2..22]), network)),
        ScriptType::P2Wpkh | ScriptType::P2Wsh => witness(0, &script[2..], network),
        ScriptType::P2Tr => witness(1, &script[2..], network),
        ScriptType::P2Pk => match p2pk_key(script) {
            Some(key) => Destination::Single(p2pkh_address(&hash160(key), network)),
            None => Destination::None,
        },
        ScriptType::Multisig => match multisig_keys(script) {
            Some(keys) => Destination::Multi(
                keys.into_iter()
                    .map(|key| p2pkh_address(&hash160(key), network))
                    .collect(),
            ),
            None => Destination::None,
        },
        ScriptType::NullData | ScriptType::Unknown => Destination::None,
    }
}

fn witness(version: u8, program: &[u8], network: Network) -> Destination {
    match segwit_address(version, program, network) {
        Ok(address) => Destination::Single(address),
        Err(_) => Destination::None,
    }
}

fn hash20(bytes: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(bytes);
    out
}
