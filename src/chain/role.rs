//! Chain roles and the role-gated operation matrix
//!
//! Every accepted connection is tagged with the role of the node within the
//! chain that owns it. The matrix below decides which operations the
//! connection serves; rejected operations answer with a specific error code
//! rather than closing the socket.
//!
//! | Request                 | head | middle | tail | solo |
//! |-------------------------|------|--------|------|------|
//! | produce                 | yes  | 131    | 131  | yes  |
//! | fetch / fetch2          | 129  | 129    | yes  | yes  |
//! | replicate (+delete)     | 135  | yes    | yes  | 135  |
//! | metadata/topics/ensure/ |      |        |      |      |
//! | delete_topic            | yes  | yes    | yes  | yes  |

use crate::error::ErrorCode;
use crate::protocol::messages::api_key;
use std::fmt;

/// Position of this node within its chain, fixed per connection at accept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Head,
    Middle,
    Tail,
    /// Single-node chain: head and tail at once
    Solo,
}

impl Role {
    /// Derive the role from a node's position in its chain
    pub fn from_position(index: usize, chain_len: usize) -> Self {
        if chain_len <= 1 {
            Role::Solo
        } else if index == 0 {
            Role::Head
        } else if index == chain_len - 1 {
            Role::Tail
        } else {
            Role::Middle
        }
    }

    /// Apply the acceptance matrix; `Err` carries the rejection code
    pub fn accepts(self, api_key: i16) -> Result<(), ErrorCode> {
        match api_key {
            api_key::PRODUCE => match self {
                Role::Head | Role::Solo => Ok(()),
                Role::Middle | Role::Tail => Err(ErrorCode::ProduceDisallowed),
            },
            api_key::FETCH | api_key::FETCH2 => match self {
                Role::Tail | Role::Solo => Ok(()),
                Role::Head | Role::Middle => Err(ErrorCode::FetchDisallowed),
            },
            api_key::REPLICATE | api_key::REPLICATE_DELETE_TOPIC => match self {
                Role::Middle | Role::Tail => Ok(()),
                Role::Head | Role::Solo => Err(ErrorCode::ReplicateDisallowed),
            },
            _ => Ok(()),
        }
    }

    /// Whether this node drives a downstream replica
    pub fn has_downstream(self) -> bool {
        matches!(self, Role::Head | Role::Middle)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Head => "head",
            Role::Middle => "middle",
            Role::Tail => "tail",
            Role::Solo => "solo",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
