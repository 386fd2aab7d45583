//! Certificate trust graph.
//!
//! Trust flows outward from the vault's own node. Starting at the own node's
//! self-signed certificate, every certificate signed by a trusted node becomes
//! a candidate for its subject: at `depth + 1` when self-signed, `depth + 2`
//! when vouched for by another node. Synconly candidates pay a +100 penalty and
//! never vouch for anyone. The walk does not revisit nodes, which matters
//! because pairing makes nodes sign each other.
//!
//! Candidates for each subject are kept best-first; the best one supplies the
//! keys used to verify that node and to encrypt to it.

use pvault_core::types::{Certificate, Item, ItemPayload};
use pvault_crypto::PublicKey;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// Priority penalty applied to synconly certificates
pub const SYNCONLY_PENALTY: u32 = 100;

/// A certificate accepted for its subject node.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustedCert {
    pub cert: Certificate,
    /// Node that signed the certificate item
    pub signer: Uuid,
    /// Lower is better
    pub priority: u32,
}

#[derive(Debug, Clone, Default)]
pub struct TrustGraph {
    own: Uuid,
    certs: BTreeMap<Uuid, Vec<TrustedCert>>,
}

impl TrustGraph {
    /// Compute trust for `own` from certificate items. Non-certificate items are
    /// ignored; items are assumed to have passed signature verification.
    pub fn build<'a>(own: Uuid, items: impl IntoIterator<Item = &'a Item>) -> Self {
        let mut by_signer: HashMap<Uuid, Vec<(u64, &Certificate)>> = HashMap::new();
        for item in items {
            if let ItemPayload::Certificate(cert) = &item.payload {
                by_signer
                    .entry(item.origin.node)
                    .or_default()
                    .push((item.origin.seqnr, cert));
            }
        }
        for certs in by_signer.values_mut() {
            certs.sort_by_key(|(seqnr, _)| *seqnr);
        }

        let mut graph = TrustGraph {
            own,
            certs: BTreeMap::new(),
        };

        let Some(root) = by_signer
            .get(&own)
            .and_then(|certs| certs.iter().find(|(_, c)| c.node == own))
            .map(|(_, c)| (*c).clone())
        else {
            return graph;
        };
        graph.certs.entry(own).or_default().push(TrustedCert {
            cert: root,
            signer: own,
            priority: 0,
        });

        let mut visited = HashSet::from([own]);
        graph.walk(own, 0, &by_signer, &mut visited);

        for candidates in graph.certs.values_mut() {
            candidates.sort_by_key(|c| c.priority);
        }
        graph
    }

    fn walk(
        &mut self,
        signer: Uuid,
        depth: u32,
        by_signer: &HashMap<Uuid, Vec<(u64, &Certificate)>>,
        visited: &mut HashSet<Uuid>,
    ) {
        let Some(signed) = by_signer.get(&signer) else {
            return;
        };
        for (_, cert) in signed {
            let subject = cert.node;
            // own certificate is anchored by the root entry alone
            if subject == self.own {
                continue;
            }
            let mut priority = if subject == signer { depth + 1 } else { depth + 2 };
            if cert.synconly() {
                priority += SYNCONLY_PENALTY;
            }
            self.certs.entry(subject).or_default().push(TrustedCert {
                cert: (*cert).clone(),
                signer,
                priority,
            });

            if !cert.synconly() && visited.insert(subject) {
                self.walk(subject, priority, by_signer, visited);
            }
        }
    }

    pub fn own_node(&self) -> Uuid {
        self.own
    }

    /// Accepted certificates for `node`, best first.
    pub fn candidates(&self, node: &Uuid) -> &[TrustedCert] {
        self.certs.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn best(&self, node: &Uuid) -> Option<&Certificate> {
        self.candidates(node).first().map(|c| &c.cert)
    }

    pub fn is_trusted(&self, node: &Uuid) -> bool {
        self.certs.contains_key(node)
    }

    /// Nodes with at least one accepted certificate.
    pub fn nodes(&self) -> impl Iterator<Item = &Uuid> {
        self.certs.keys()
    }

    /// Best certificate per trusted node.
    pub fn best_certificates(&self) -> Vec<&Certificate> {
        self.certs.values().filter_map(|c| c.first()).map(|c| &c.cert).collect()
    }

    /// Nodes new items are encrypted to: every trusted node whose best
    /// certificate is not synconly, the own node included.
    pub fn encryption_recipients(&self) -> Vec<&Certificate> {
        self.best_certificates()
            .into_iter()
            .filter(|c| !c.synconly())
            .collect()
    }

    /// Key to verify item signatures from `node`. Synconly nodes sign nothing
    /// we accept, so they have no verify key.
    pub fn verify_key(&self, node: &Uuid) -> Option<PublicKey> {
        let cert = self.best(node)?;
        if cert.synconly() {
            return None;
        }
        PublicKey::from_der(cert.keys.sign.key.as_bytes()).ok()
    }

    /// Key to check channel-binding signatures from `node`. Synconly nodes may
    /// authenticate for sync.
    pub fn auth_key(&self, node: &Uuid) -> Option<PublicKey> {
        let cert = self.best(node)?;
        PublicKey::from_der(cert.keys.auth.key.as_bytes()).ok()
    }
}
