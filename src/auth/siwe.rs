//! Sign-In with Ethereum (EIP-4361) verification.
//!
//! Parses the plain-text SIWE message for the claimed address and nonce,
//! then recovers the signer from the personal-sign signature and checks the
//! two agree. All returned addresses are lowercased.

use alloy_primitives::{Address, Signature};
use anyhow::{bail, Context, Result};
use k256::ecdsa::SigningKey;

/// Fields the auth flow needs out of a SIWE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiweFields {
    pub address: String,
    pub nonce: String,
}

fn format_address(address: Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}

/// Extract the claimed address and nonce from an EIP-4361 message.
///
/// The message's second line is the account address; the nonce appears on a
/// `Nonce:` line. Anything else in the message is opaque to us.
pub fn parse_message(message: &str) -> Result<SiweFields> {
    let mut lines = message.lines();

    let first = lines.next().context("empty SIWE message")?;
    if !first.contains("wants you to sign in with your Ethereum account") {
        bail!("not a SIWE message");
    }

    let address_line = lines.next().context("missing address line")?.trim();
    if !address_line.starts_with("0x") || address_line.len() != 42 {
        bail!("invalid address in SIWE message");
    }

    let nonce = message
        .lines()
        .find_map(|line| line.trim().strip_prefix("Nonce:"))
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .context("missing nonce in SIWE message")?;

    Ok(SiweFields {
        address: address_line.to_lowercase(),
        nonce,
    })
}

/// Verify a SIWE message signature. Returns the authenticated address.
pub fn verify_message(message: &str, signature_hex: &str) -> Result<SiweFields> {
    let fields = parse_message(message)?;

    let raw = hex::decode(signature_hex.trim().trim_start_matches("0x"))
        .context("signature is not hex")?;
    let signature = Signature::try_from(raw.as_slice()).context("malformed signature")?;

    // EIP-191 personal-sign recovery over the raw message text.
    let recovered = signature
        .recover_address_from_msg(message.as_bytes())
        .context("signature recovery failed")?;

    if format_address(recovered) != fields.address {
        bail!("signature does not match the claimed address");
    }
    Ok(fields)
}

/// Derive the operator's wallet address from the configured private key.
pub fn derive_owner_address(private_key_hex: &str) -> Result<String> {
    let key = private_key_hex.trim().trim_start_matches("0x");
    if key.is_empty() {
        bail!("no private key configured");
    }
    let raw = hex::decode(key).context("private key is not hex")?;
    let signing_key = SigningKey::from_slice(&raw).context("invalid private key")?;
    Ok(format_address(Address::from_private_key(&signing_key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn siwe_message(address: &str, nonce: &str) -> String {
        format!(
            "example.com wants you to sign in with your Ethereum account:\n\
             {address}\n\
             \n\
             Sign in to the trading dashboard.\n\
             \n\
             URI: https://example.com\n\
             Version: 1\n\
             Chain ID: 137\n\
             Nonce: {nonce}\n\
             Issued At: 2024-01-01T00:00:00Z"
        )
    }

    #[test]
    fn test_parse_message_extracts_fields() {
        let msg = siwe_message("0xAbCd000000000000000000000000000000001234", "deadbeef01");
        let fields = parse_message(&msg).unwrap();
        assert_eq!(fields.address, "0xabcd000000000000000000000000000000001234");
        assert_eq!(fields.nonce, "deadbeef01");
    }

    #[test]
    fn test_parse_rejects_non_siwe_text() {
        assert!(parse_message("hello world").is_err());
        assert!(parse_message("").is_err());

        let missing_nonce = "example.com wants you to sign in with your Ethereum account:\n\
                             0xabcd000000000000000000000000000000001234\n";
        assert!(parse_message(missing_nonce).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_address() {
        let msg = siwe_message("not-an-address", "deadbeef01");
        assert!(parse_message(&msg).is_err());
    }

    #[test]
    fn test_derive_owner_address_known_key() {
        // Well-known test vector: key 0x...01 maps to this address.
        let address = derive_owner_address(
            "0000000000000000000000000000000000000000000000000000000000000001",
        )
        .unwrap();
        assert_eq!(address, "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf");

        let with_prefix = derive_owner_address(
            "0x0000000000000000000000000000000000000000000000000000000000000001",
        )
        .unwrap();
        assert_eq!(with_prefix, address);
    }

    #[test]
    fn test_derive_owner_address_rejects_garbage() {
        assert!(derive_owner_address("").is_err());
        assert!(derive_owner_address("zz").is_err());
    }

    #[test]
    fn test_verify_roundtrip_with_generated_key() {
        use alloy_primitives::utils::eip191_hash_message;

        let signing_key = SigningKey::from_slice(&[0x42u8; 32]).unwrap();
        let address = format_address(Address::from_private_key(&signing_key));
        let message = siwe_message(&address, "cafebabe42");

        let digest = eip191_hash_message(message.as_bytes());
        let (sig, recovery_id) = signing_key
            .sign_prehash_recoverable(digest.as_slice())
            .unwrap();
        let mut raw = sig.to_bytes().to_vec();
        raw.push(27 + recovery_id.to_byte());
        let signature_hex = hex::encode(raw);

        let fields = verify_message(&message, &signature_hex).unwrap();
        assert_eq!(fields.address, address);
        assert_eq!(fields.nonce, "cafebabe42");

        // A different claimed address must be rejected.
        let other = siwe_message(
            "0x0000000000000000000000000000000000000001",
            "cafebabe42",
        );
        assert!(verify_message(&other, &signature_hex).is_err());
    }
}
