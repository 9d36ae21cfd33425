//! Lifecycle of one enforcement action: Pending -> Exists -> Deleted, or Pending -> Deleted.

use crate::protocol::{Message, PolicyAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyState {
    /// CreatePolicy sent, id not yet known.
    Pending,
    Exists,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub site: u32,
    pub species: String,
    pub action: PolicyAction,
    id: Option<u32>,
    state: PolicyState,
}

impl Policy {
    pub fn create(site: u32, species: impl Into<String>, action: PolicyAction) -> Self {
        Self {
            site,
            species: species.into(),
            action,
            id: None,
            state: PolicyState::Pending,
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.id
    }

    pub fn state(&self) -> PolicyState {
        self.state
    }

    /// Record the authority's id. Returns the DeletePolicy to send when deletion was
    /// requested while the id was outstanding.
    pub fn assign_id(&mut self, id: u32) -> Option<Message> {
        match self.state {
            PolicyState::Exists => None,
            PolicyState::Pending => {
                self.id = Some(id);
                self.state = PolicyState::Exists;
                None
            }
            PolicyState::Deleted => {
                if self.id.is_some() {
                    return None;
                }
                self.id = Some(id);
                Some(Message::DeletePolicy { policy_id: id })
            }
        }
    }

    /// Retire the policy. Returns the DeletePolicy to send now, if the id is already known.
    pub fn request_delete(&mut self) -> Option<Message> {
        match self.state {
            PolicyState::Pending => {
                self.state = PolicyState::Deleted;
                None
            }
            PolicyState::Exists => {
                self.state = PolicyState::Deleted;
                self.id.map(|policy_id| Message::DeletePolicy { policy_id })
            }
            PolicyState::Deleted => None,
        }
    }

    /// Nothing left to send for this policy.
    pub fn is_settled(&self) -> bool {
        self.state == PolicyState::Deleted && self.id.is_some()
    }
}
