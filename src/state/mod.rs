//! State Management Module
//!
//! Peer identities, statuses and the membership interface.

mod membership;

pub use membership::{Membership, PeerInfo, PeerStatus, ReplayPlan, StaticMembership};
