use docuflow_core::OwnerId;

/// Role of the requesting user, as asserted by the session layer upstream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OwnerRole {
    Member,
    Admin,
}

/// Owner context for a request.
///
/// This is immutable and must be present for all job routes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OwnerContext {
    owner_id: OwnerId,
    role: OwnerRole,
}

impl OwnerContext {
    pub fn new(owner_id: OwnerId, role: OwnerRole) -> Self {
        Self { owner_id, role }
    }

    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    pub fn is_admin(&self) -> bool {
        self.role == OwnerRole::Admin
    }

    /// Whether this request may see a job owned by `owner`.
    pub fn can_view(&self, owner: OwnerId) -> bool {
        self.is_admin() || self.owner_id == owner
    }
}
