// =============================================================================
// Agent Signer — EIP-712 signing for venue exchange actions
// =============================================================================
//
// L1 actions (order / cancel / updateLeverage) are hashed as:
//   keccak256(msgpack(action) ‖ nonce_be ‖ vault_flag[,vault_address])
// and the resulting `connectionId` is signed as the EIP-712 struct
// `Agent{source, connectionId}` under the fixed "Exchange" domain.
//
// User-signed actions (agent approval) use the venue's
// "HyperliquidSignTransaction" domain. That struct's type name contains a
// colon, which `sol!` cannot express, so its digest is assembled manually.
//
// The private key lives inside the wrapped signer and is never exposed; only
// the Secret Store constructs this type.
// =============================================================================

use alloy::primitives::{keccak256, Address, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol;
use alloy::sol_types::{eip712_domain, SolStruct};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

sol! {
    struct Agent {
        string source;
        bytes32 connectionId;
    }
}

/// r/s/v signature triple in the shape the exchange endpoint expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueSignature {
    pub r: String,
    pub s: String,
    pub v: u64,
}

/// Source tag inside the Agent struct: "a" for mainnet, "b" for testnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    fn agent_source(self) -> &'static str {
        match self {
            Self::Mainnet => "a",
            Self::Testnet => "b",
        }
    }
}

// =============================================================================
// AgentSigner
// =============================================================================

/// A signer scoped to venue trading actions. The wrapped key is an
/// agent-wallet key: it cannot authorise withdrawals by construction.
pub struct AgentSigner {
    inner: PrivateKeySigner,
    network: Network,
}

impl AgentSigner {
    /// Parse a hex private key (with or without 0x prefix).
    pub fn from_hex(key_hex: &str) -> Result<Self> {
        let trimmed = key_hex.trim();
        let stripped = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = Zeroizing::new(hex::decode(stripped).context("agent key is not valid hex")?);
        let inner =
            PrivateKeySigner::from_slice(&bytes).context("agent key is not a valid secp256k1 scalar")?;
        Ok(Self {
            inner,
            network: Network::Mainnet,
        })
    }

    #[cfg(test)]
    pub fn for_testnet(mut self) -> Self {
        self.network = Network::Testnet;
        self
    }

    /// The agent wallet's address.
    pub fn address(&self) -> Address {
        self.inner.address()
    }

    /// Sign an L1 exchange action (order / cancel / updateLeverage).
    pub fn sign_l1_action(
        &self,
        action: &serde_json::Value,
        nonce: u64,
        vault: Option<Address>,
    ) -> Result<VenueSignature> {
        let connection_id = l1_action_hash(action, nonce, vault)?;

        let agent = Agent {
            source: self.network.agent_source().to_string(),
            connectionId: connection_id,
        };
        let domain = eip712_domain! {
            name: "Exchange",
            version: "1",
            chain_id: 1337,
            verifying_contract: Address::ZERO,
        };

        let digest = agent.eip712_signing_hash(&domain);
        let sig = self
            .inner
            .sign_hash_sync(&digest)
            .context("failed to sign L1 action digest")?;

        Ok(signature_parts(sig))
    }
}

impl std::fmt::Debug for AgentSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSigner")
            .field("address", &self.inner.address())
            .field("key", &"<redacted>")
            .finish()
    }
}

fn signature_parts(sig: alloy::primitives::PrimitiveSignature) -> VenueSignature {
    // 65 bytes: r ‖ s ‖ v, with v already in {27, 28}.
    let bytes = sig.as_bytes();
    VenueSignature {
        r: format!("0x{}", hex::encode(&bytes[..32])),
        s: format!("0x{}", hex::encode(&bytes[32..64])),
        v: bytes[64] as u64,
    }
}

// =============================================================================
// Action hashing
// =============================================================================

/// Hash an L1 action into its `connectionId`: msgpack of the action with
/// field order preserved, then the big-endian nonce, then the vault flag.
pub fn l1_action_hash(
    action: &serde_json::Value,
    nonce: u64,
    vault: Option<Address>,
) -> Result<B256> {
    let mut data = rmp_serde::to_vec_named(action).context("failed to msgpack-encode action")?;
    data.extend_from_slice(&nonce.to_be_bytes());
    match vault {
        None => data.push(0x00),
        Some(addr) => {
            data.push(0x01);
            data.extend_from_slice(addr.as_slice());
        }
    }
    Ok(keccak256(&data))
}

// =============================================================================
// Agent-approval typed data (user-signed, assembled manually)
// =============================================================================

/// The typed-data payload a main wallet signs to approve an agent. The core
/// never signs this itself; it computes the digest so the transport can
/// verify or construct the request for an external wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveAgentPayload {
    pub hyperliquid_chain: String,
    pub signature_chain_id: String,
    pub agent_address: String,
    pub agent_name: String,
    pub nonce: u64,
}

const APPROVE_AGENT_TYPE: &str = "HyperliquidTransaction:ApproveAgent(string hyperliquidChain,address agentAddress,string agentName,uint64 nonce)";
const DOMAIN_TYPE: &str =
    "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";

/// EIP-712 digest of an agent-approval payload under the
/// HyperliquidSignTransaction domain.
pub fn approve_agent_digest(payload: &ApproveAgentPayload) -> Result<B256> {
    let agent_address: Address = payload
        .agent_address
        .parse()
        .context("agent_address is not a valid address")?;
    let chain_id = parse_chain_id(&payload.signature_chain_id)?;

    // hashStruct(message)
    let mut enc = Vec::with_capacity(5 * 32);
    enc.extend_from_slice(keccak256(APPROVE_AGENT_TYPE.as_bytes()).as_slice());
    enc.extend_from_slice(keccak256(payload.hyperliquid_chain.as_bytes()).as_slice());
    enc.extend_from_slice(&left_pad_address(agent_address));
    enc.extend_from_slice(keccak256(payload.agent_name.as_bytes()).as_slice());
    enc.extend_from_slice(&left_pad_u64(payload.nonce));
    let struct_hash = keccak256(&enc);

    // hashStruct(domain)
    let mut dom = Vec::with_capacity(5 * 32);
    dom.extend_from_slice(keccak256(DOMAIN_TYPE.as_bytes()).as_slice());
    dom.extend_from_slice(keccak256(b"HyperliquidSignTransaction").as_slice());
    dom.extend_from_slice(keccak256(b"1").as_slice());
    dom.extend_from_slice(&chain_id.to_be_bytes::<32>());
    dom.extend_from_slice(&left_pad_address(Address::ZERO));
    let domain_hash = keccak256(&dom);

    let mut digest_input = Vec::with_capacity(2 + 64);
    digest_input.extend_from_slice(&[0x19, 0x01]);
    digest_input.extend_from_slice(domain_hash.as_slice());
    digest_input.extend_from_slice(struct_hash.as_slice());
    Ok(keccak256(&digest_input))
}

fn parse_chain_id(raw: &str) -> Result<U256> {
    let trimmed = raw.trim();
    if let Some(hex_part) = trimmed.strip_prefix("0x") {
        U256::from_str_radix(hex_part, 16).context("signature_chain_id is not valid hex")
    } else {
        U256::from_str_radix(trimmed, 10).context("signature_chain_id is not a valid integer")
    }
}

fn left_pad_address(addr: Address) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[12..].copy_from_slice(addr.as_slice());
    out
}

fn left_pad_u64(value: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[24..].copy_from_slice(&value.to_be_bytes());
    out
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TEST_KEY: &str = "0x0123456789012345678901234567890123456789012345678901234567890123";

    fn order_action() -> serde_json::Value {
        json!({
            "type": "order",
            "orders": [{
                "a": 0,
                "b": true,
                "p": "43000",
                "s": "0.01",
                "r": false,
                "t": { "limit": { "tif": "Gtc" } }
            }],
            "grouping": "na"
        })
    }

    #[test]
    fn signer_parses_hex_with_and_without_prefix() {
        let a = AgentSigner::from_hex(TEST_KEY).unwrap();
        let b = AgentSigner::from_hex(&TEST_KEY[2..]).unwrap();
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn rejects_bad_key() {
        assert!(AgentSigner::from_hex("not-hex").is_err());
        assert!(AgentSigner::from_hex("0x1234").is_err());
    }

    #[test]
    fn l1_hash_changes_with_nonce() {
        let action = order_action();
        let h1 = l1_action_hash(&action, 1, None).unwrap();
        let h2 = l1_action_hash(&action, 2, None).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn l1_hash_changes_with_vault_flag() {
        let action = order_action();
        let h1 = l1_action_hash(&action, 1, None).unwrap();
        let h2 = l1_action_hash(&action, 1, Some(Address::ZERO)).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn l1_signature_is_deterministic() {
        // RFC 6979 nonces: identical input must produce an identical signature.
        let signer = AgentSigner::from_hex(TEST_KEY).unwrap();
        let action = order_action();
        let s1 = signer.sign_l1_action(&action, 42, None).unwrap();
        let s2 = signer.sign_l1_action(&action, 42, None).unwrap();
        assert_eq!(s1.r, s2.r);
        assert_eq!(s1.s, s2.s);
        assert_eq!(s1.v, s2.v);
    }

    #[test]
    fn signature_shape() {
        let signer = AgentSigner::from_hex(TEST_KEY).unwrap();
        let sig = signer.sign_l1_action(&order_action(), 42, None).unwrap();
        assert_eq!(sig.r.len(), 66);
        assert!(sig.r.starts_with("0x"));
        assert_eq!(sig.s.len(), 66);
        assert!(sig.v == 27 || sig.v == 28);
    }

    #[test]
    fn testnet_and_mainnet_sign_differently() {
        let main = AgentSigner::from_hex(TEST_KEY).unwrap();
        let test = AgentSigner::from_hex(TEST_KEY).unwrap().for_testnet();
        let action = order_action();
        let s1 = main.sign_l1_action(&action, 42, None).unwrap();
        let s2 = test.sign_l1_action(&action, 42, None).unwrap();
        assert_ne!((s1.r, s1.s), (s2.r, s2.s));
    }

    #[test]
    fn approve_agent_digest_is_stable_and_sensitive() {
        let payload = ApproveAgentPayload {
            hyperliquid_chain: "Mainnet".into(),
            signature_chain_id: "0xa4b1".into(),
            agent_address: "0x1234567890123456789012345678901234567890".into(),
            agent_name: "meridian".into(),
            nonce: 1_700_000_000_000,
        };
        let d1 = approve_agent_digest(&payload).unwrap();
        let d2 = approve_agent_digest(&payload).unwrap();
        assert_eq!(d1, d2);

        let mut other = payload.clone();
        other.nonce += 1;
        assert_ne!(d1, approve_agent_digest(&other).unwrap());
    }

    #[test]
    fn approve_agent_digest_rejects_bad_address() {
        let payload = ApproveAgentPayload {
            hyperliquid_chain: "Mainnet".into(),
            signature_chain_id: "0xa4b1".into(),
            agent_address: "not-an-address".into(),
            agent_name: "meridian".into(),
            nonce: 1,
        };
        assert!(approve_agent_digest(&payload).is_err());
    }

    #[test]
    fn chain_id_parses_hex_and_decimal() {
        assert_eq!(parse_chain_id("0xa4b1").unwrap(), U256::from(42161u64));
        assert_eq!(parse_chain_id("42161").unwrap(), U256::from(42161u64));
        assert!(parse_chain_id("zz").is_err());
    }
}
