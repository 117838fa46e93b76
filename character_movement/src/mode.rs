use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementMode {
    None,
    #[default]
    Walking,
    NavWalking,
    Falling,
    Swimming,
    Flying,
    /// Caller-defined physics, carrying a sub-mode in 0..=31.
    Custom(u8),
}

const CUSTOM_INDEX: u8 = 6;
pub const MAX_CUSTOM_SUB_MODE: u8 = 31;

impl MovementMode {
    pub fn is_moving_on_ground(self) -> bool {
        matches!(self, MovementMode::Walking | MovementMode::NavWalking)
    }

    pub fn is_falling(self) -> bool {
        self == MovementMode::Falling
    }

    /// Network byte: low three bits carry the mode, custom sub-modes the rest.
    pub fn pack(self) -> u8 {
        match self {
            MovementMode::None => 0,
            MovementMode::Walking => 1,
            MovementMode::NavWalking => 2,
            MovementMode::Falling => 3,
            MovementMode::Swimming => 4,
            MovementMode::Flying => 5,
            MovementMode::Custom(sub) => CUSTOM_INDEX | (sub.min(MAX_CUSTOM_SUB_MODE) << 3),
        }
    }

    pub fn unpack(byte: u8) -> Option<Self> {
        let sub = byte >> 3;
        let mode = match byte & 0x07 {
            CUSTOM_INDEX => return Some(MovementMode::Custom(sub)),
            0 => MovementMode::None,
            1 => MovementMode::Walking,
            2 => MovementMode::NavWalking,
            3 => MovementMode::Falling,
            4 => MovementMode::Swimming,
            5 => MovementMode::Flying,
            _ => return None,
        };
        (sub == 0).then_some(mode)
    }
}
