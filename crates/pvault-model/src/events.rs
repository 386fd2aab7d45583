use uuid::Uuid;

/// Broadcast by the model after state changes. Receivers that fall behind
/// miss events; nothing in the model depends on delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelEvent {
    VaultCreated { vault: Uuid },
    VaultUnlocked { vault: Uuid },
    VaultLocked { vault: Uuid },
    VaultDeleted { vault: Uuid },
    /// New versions were stored. `local` is set when this node authored them.
    VersionsAdded { vault: Uuid, local: bool },
    CertificateAdded { vault: Uuid, node: Uuid },
}

impl ModelEvent {
    pub fn vault(&self) -> Uuid {
        match self {
            ModelEvent::VaultCreated { vault }
            | ModelEvent::VaultUnlocked { vault }
            | ModelEvent::VaultLocked { vault }
            | ModelEvent::VaultDeleted { vault }
            | ModelEvent::VersionsAdded { vault, .. }
            | ModelEvent::CertificateAdded { vault, .. } => *vault,
        }
    }
}
