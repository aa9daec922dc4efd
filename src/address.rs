//! Address derivation engine.
//!
//! Pure mapping from an output script to a canonical address string for the
//! configured network. Recognition is an ordered list of pattern matchers
//! over the raw script bytes; the first match wins. Scripts matching no
//! pattern (bare multisig, OP_RETURN, non-standard) yield `None`: a
//! recognized "no trackable address" outcome, not an error.
//!
//! No network or storage access happens here, so the whole engine is
//! exhaustively table-testable.

use bech32::Hrp;
use sha2::{Digest, Sha256};

use crate::types::Network;

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_0: u8 = 0x00;
const OP_1: u8 = 0x51;

/// Recognized script families, carrying the hash or witness program
/// extracted from the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptClass {
    P2pkh([u8; 20]),
    P2sh([u8; 20]),
    P2wpkh([u8; 20]),
    P2wsh([u8; 32]),
    P2tr([u8; 32]),
}

type Matcher = fn(&[u8]) -> Option<ScriptClass>;

/// Ordered matcher list; first match wins. Extending the engine means
/// appending a matcher, not deepening a branch tree.
const MATCHERS: &[Matcher] = &[
    match_p2pkh,
    match_p2sh,
    match_p2wpkh,
    match_p2wsh,
    match_p2tr,
];

/// OP_DUP OP_HASH160 <20-byte hash> OP_EQUALVERIFY OP_CHECKSIG
fn match_p2pkh(script: &[u8]) -> Option<ScriptClass> {
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[3..23]);
        Some(ScriptClass::P2pkh(hash))
    } else {
        None
    }
}

/// OP_HASH160 <20-byte hash> OP_EQUAL
fn match_p2sh(script: &[u8]) -> Option<ScriptClass> {
    if script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
    {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[2..22]);
        Some(ScriptClass::P2sh(hash))
    } else {
        None
    }
}

/// Witness v0, 20-byte program.
fn match_p2wpkh(script: &[u8]) -> Option<ScriptClass> {
    if script.len() == 22 && script[0] == OP_0 && script[1] == 0x14 {
        let mut program = [0u8; 20];
        program.copy_from_slice(&script[2..]);
        Some(ScriptClass::P2wpkh(program))
    } else {
        None
    }
}

/// Witness v0, 32-byte program.
fn match_p2wsh(script: &[u8]) -> Option<ScriptClass> {
    if script.len() == 34 && script[0] == OP_0 && script[1] == 0x20 {
        let mut program = [0u8; 32];
        program.copy_from_slice(&script[2..]);
        Some(ScriptClass::P2wsh(program))
    } else {
        None
    }
}

/// Witness v1 (taproot), 32-byte program.
fn match_p2tr(script: &[u8]) -> Option<ScriptClass> {
    if script.len() == 34 && script[0] == OP_1 && script[1] == 0x20 {
        let mut program = [0u8; 32];
        program.copy_from_slice(&script[2..]);
        Some(ScriptClass::P2tr(program))
    } else {
        None
    }
}

/// Classify a raw output script. `None` means no recognized family.
pub fn classify(script: &[u8]) -> Option<ScriptClass> {
    MATCHERS.iter().find_map(|m| m(script))
}

fn sha256d(data: &[u8]) -> Vec<u8> {
    let first = Sha256::digest(data);
    Sha256::digest(&first).to_vec()
}

/// Version byte + payload + 4-byte double-SHA256 checksum, base58.
fn base58check(version: u8, payload: &[u8]) -> String {
    let mut extended = vec![version];
    extended.extend_from_slice(payload);
    let checksum = sha256d(&extended);
    extended.extend_from_slice(&checksum[0..4]);
    bs58::encode(extended).into_string()
}

/// Segwit address for the given witness version and program. The encoder
/// picks bech32 for v0 and bech32m for v1+ per the version rules.
fn segwit_address(network: Network, version: bech32::Fe32, program: &[u8]) -> Option<String> {
    let hrp = Hrp::parse(network.hrp()).ok()?;
    bech32::segwit::encode(hrp, version, program).ok()
}

/// Derive the canonical address string for an output script, or `None` if
/// the script belongs to no recognized family.
pub fn derive_address(script: &[u8], network: Network) -> Option<String> {
    match classify(script)? {
        ScriptClass::P2pkh(hash) => Some(base58check(network.p2pkh_version(), &hash)),
        ScriptClass::P2sh(hash) => Some(base58check(network.p2sh_version(), &hash)),
        ScriptClass::P2wpkh(program) => {
            segwit_address(network, bech32::segwit::VERSION_0, &program)
        }
        ScriptClass::P2wsh(program) => segwit_address(network, bech32::segwit::VERSION_0, &program),
        ScriptClass::P2tr(program) => segwit_address(network, bech32::segwit::VERSION_1, &program),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derive_hex(script_hex: &str, network: Network) -> Option<String> {
        derive_address(&hex::decode(script_hex).unwrap(), network)
    }

    /// Decode a base58check address back to (version, payload), verifying
    /// the checksum.
    fn base58check_decode(addr: &str) -> (u8, Vec<u8>) {
        let raw = bs58::decode(addr).into_vec().unwrap();
        let (body, checksum) = raw.split_at(raw.len() - 4);
        assert_eq!(&sha256d(body)[0..4], checksum, "bad base58 checksum");
        (body[0], body[1..].to_vec())
    }

    // Script hex → expected address, per family and network. The segwit
    // vectors are the BIP-173/BIP-350 reference vectors; the P2PKH vector
    // is the classic version-1 address example.
    const VECTORS: &[(&str, Network, &str)] = &[
        (
            "76a914010966776006953d5567439e5e39f86a0d273bee88ac",
            Network::Mainnet,
            "16UwLL9Risc3QfPqBUvKofHmBQ7wMtjvM",
        ),
        (
            "0014751e76e8199196d454941c45d1b3a323f1433bd6",
            Network::Mainnet,
            "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4",
        ),
        (
            "0014751e76e8199196d454941c45d1b3a323f1433bd6",
            Network::Testnet,
            "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx",
        ),
        (
            "00201863143c14c5166804bd19203356da136c985678cd4d27a1b8c6329604903262",
            Network::Mainnet,
            "bc1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3qccfmv2",
        ),
        (
            "512079be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
            Network::Mainnet,
            "bc1p0xlxvlhemja6c4dqv22uapctqupfhlxm9h8z3k2e72q4k9hcz7vqzk5jj0",
        ),
    ];

    #[test]
    fn known_vectors() {
        for (script, network, expected) in VECTORS {
            assert_eq!(
                derive_hex(script, *network).as_deref(),
                Some(*expected),
                "script {}",
                script
            );
        }
    }

    #[test]
    fn derivation_is_deterministic() {
        let script = hex::decode("0014751e76e8199196d454941c45d1b3a323f1433bd6").unwrap();
        let a = derive_address(&script, Network::Mainnet);
        let b = derive_address(&script, Network::Mainnet);
        assert_eq!(a, b);
    }

    #[test]
    fn p2pkh_round_trip() {
        let hash = [0x4bu8; 20];
        let mut script = vec![OP_DUP, OP_HASH160, 0x14];
        script.extend_from_slice(&hash);
        script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);

        for network in [Network::Mainnet, Network::Testnet] {
            let addr = derive_address(&script, network).unwrap();
            let (version, payload) = base58check_decode(&addr);
            assert_eq!(version, network.p2pkh_version());
            assert_eq!(payload, hash);
        }
    }

    #[test]
    fn p2sh_round_trip() {
        let hash = [0xe1u8; 20];
        let mut script = vec![OP_HASH160, 0x14];
        script.extend_from_slice(&hash);
        script.push(OP_EQUAL);

        for network in [Network::Mainnet, Network::Testnet] {
            let addr = derive_address(&script, network).unwrap();
            let (version, payload) = base58check_decode(&addr);
            assert_eq!(version, network.p2sh_version());
            assert_eq!(payload, hash);
        }
        // Mainnet P2SH addresses start with '3', testnet with '2'.
        assert!(derive_address(&script, Network::Mainnet)
            .unwrap()
            .starts_with('3'));
        assert!(derive_address(&script, Network::Testnet)
            .unwrap()
            .starts_with('2'));
    }

    #[test]
    fn segwit_round_trips() {
        let cases: &[(&[u8], u8)] = &[
            (&[0x11u8; 20], 0), // P2WPKH
            (&[0x22u8; 32], 0), // P2WSH
            (&[0x33u8; 32], 1), // P2TR
        ];
        for (program, version) in cases {
            let mut script = vec![if *version == 0 { OP_0 } else { OP_1 }, program.len() as u8];
            script.extend_from_slice(program);

            let addr = derive_address(&script, Network::Mainnet).unwrap();
            let (hrp, ver, decoded) = bech32::segwit::decode(&addr).unwrap();
            assert_eq!(hrp, Hrp::parse("bc").unwrap());
            assert_eq!(ver.to_u8(), *version);
            assert_eq!(decoded.as_slice(), *program);
        }
    }

    #[test]
    fn unrecognized_scripts_yield_none() {
        // OP_RETURN with payload.
        assert_eq!(derive_hex("6a0b68656c6c6f20776f726c64", Network::Mainnet), None);
        // Bare 1-of-1 multisig: OP_1 <33-byte key> OP_1 OP_CHECKMULTISIG.
        let mut multisig = vec![OP_1, 0x21];
        multisig.extend_from_slice(&[0x02u8; 33]);
        multisig.extend_from_slice(&[OP_1, 0xae]);
        assert_eq!(derive_address(&multisig, Network::Mainnet), None);
        // Empty script.
        assert_eq!(derive_address(&[], Network::Mainnet), None);
        // Truncated P2PKH.
        assert_eq!(
            derive_hex("76a914010966776006953d5567439e5e39f86a0d273b88ac", Network::Mainnet),
            None
        );
        // Witness v0 with a program length no family uses.
        let mut odd = vec![OP_0, 0x19];
        odd.extend_from_slice(&[0u8; 25]);
        assert_eq!(derive_address(&odd, Network::Mainnet), None);
    }

    #[test]
    fn classify_extracts_program() {
        let mut script = vec![OP_0, 0x14];
        script.extend_from_slice(&[0x77u8; 20]);
        assert_eq!(classify(&script), Some(ScriptClass::P2wpkh([0x77u8; 20])));
        assert_eq!(classify(&[OP_DUP]), None);
    }
}
