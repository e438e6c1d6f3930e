// src/models/user.rs
use serde::{Deserialize, Serialize};

use super::order::Actor;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Driver,    // Takes rides through the realtime channel
    Operator,  // Creates orders and watches the fleet
}

/// Who a session token belongs to
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Identity {
    pub actor_id: String,
    pub role: Role,
}

impl Identity {
    pub fn driver(id: impl Into<String>) -> Self {
        Self { actor_id: id.into(), role: Role::Driver }
    }

    pub fn operator(id: impl Into<String>) -> Self {
        Self { actor_id: id.into(), role: Role::Operator }
    }

    pub fn as_actor(&self) -> Actor {
        match self.role {
            Role::Driver => Actor::Driver(self.actor_id.clone()),
            Role::Operator => Actor::Operator(self.actor_id.clone()),
        }
    }
}
