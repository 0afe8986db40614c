use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use tracing::debug;
use crate::error::RelayError;
use crate::relay::resolver::NodeId;

const SIGNATURE_CONTEXT: &[u8] = b"gene-relay";

/// Permission to create a relay mapping towards `target`, issued for one specific connection
///  (identified by its salt) so it can not be replayed on other connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCertificate {
    /// the issuer's key
    pub public_key: VerifyingKey,
    pub salt: u64,
    pub target: NodeId,
    pub signature: Signature,
}

impl RelayCertificate {
    pub fn sign(issuer: &SigningKey, salt: u64, target: NodeId) -> RelayCertificate {
        RelayCertificate {
            public_key: issuer.verifying_key(),
            salt,
            target,
            signature: issuer.sign(&Self::signed_message(salt, target)),
        }
    }

    fn signed_message(salt: u64, target: NodeId) -> Vec<u8> {
        let mut message = Vec::with_capacity(SIGNATURE_CONTEXT.len() + 2 * size_of::<u64>());
        message.extend_from_slice(SIGNATURE_CONTEXT);
        message.extend_from_slice(&salt.to_le_bytes());
        message.extend_from_slice(&target.0.to_le_bytes());
        message
    }
}

/// Checks relay certificates against the one trusted issuer key
pub struct RelayAuthorizer {
    trusted: VerifyingKey,
}

impl RelayAuthorizer {
    pub fn new(trusted: VerifyingKey) -> RelayAuthorizer {
        RelayAuthorizer { trusted }
    }

    pub fn verify(&self, certificate: &RelayCertificate, connection_salt: u64, target: NodeId) -> Result<(), RelayError> {
        if certificate.public_key != self.trusted {
            debug!("relay certificate from an untrusted issuer");
            return Err(RelayError::NotAuthenticated);
        }
        if certificate.salt != connection_salt || certificate.target != target {
            debug!("relay certificate was issued for a different connection or target");
            return Err(RelayError::NotAuthenticated);
        }

        self.trusted.verify(&RelayCertificate::signed_message(certificate.salt, certificate.target), &certificate.signature)
            .map_err(|e| {
                debug!("relay certificate signature is invalid: {}", e);
                RelayError::NotAuthenticated
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::test_util::signing_key;

    #[test]
    fn test_valid_certificate() {
        let issuer = signing_key();
        let authorizer = RelayAuthorizer::new(issuer.verifying_key());
        let certificate = RelayCertificate::sign(&issuer, 77, NodeId(5));
        assert_eq!(authorizer.verify(&certificate, 77, NodeId(5)), Ok(()));
    }

    #[rstest]
    #[case::other_salt(78, NodeId(5))]
    #[case::other_target(77, NodeId(6))]
    fn test_replayed_certificate(#[case] salt: u64, #[case] target: NodeId) {
        let issuer = signing_key();
        let authorizer = RelayAuthorizer::new(issuer.verifying_key());
        let certificate = RelayCertificate::sign(&issuer, 77, NodeId(5));
        assert_eq!(authorizer.verify(&certificate, salt, target), Err(RelayError::NotAuthenticated));
    }

    #[test]
    fn test_untrusted_issuer() {
        let authorizer = RelayAuthorizer::new(signing_key().verifying_key());
        let certificate = RelayCertificate::sign(&signing_key(), 77, NodeId(5));
        assert_eq!(authorizer.verify(&certificate, 77, NodeId(5)), Err(RelayError::NotAuthenticated));
    }

    #[test]
    fn test_tampered_certificate() {
        let issuer = signing_key();
        let authorizer = RelayAuthorizer::new(issuer.verifying_key());
        let mut certificate = RelayCertificate::sign(&issuer, 77, NodeId(5));
        certificate.salt = 78;
        assert_eq!(authorizer.verify(&certificate, 78, NodeId(5)), Err(RelayError::NotAuthenticated));
    }
}
