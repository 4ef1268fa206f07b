use std::fmt;
use std::str::FromStr;

use rand::Rng;

use crate::AppError;

/// Game controls, in the index order used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Control {
    Left,
    Right,
    Up,
    Down,
    Jump,
    Action,
    Start,
    Escape,
    MenuSelect,
    MenuSelectSpace,
    MenuBack,
    Remove,
    CheatMenu,
    DebugMenu,
    Console,
    PeekLeft,
    PeekRight,
    PeekUp,
    PeekDown,
}

impl Control {
    pub const COUNT: usize = 19;

    pub const ALL: [Control; Control::COUNT] = [
        Control::Left,
        Control::Right,
        Control::Up,
        Control::Down,
        Control::Jump,
        Control::Action,
        Control::Start,
        Control::Escape,
        Control::MenuSelect,
        Control::MenuSelectSpace,
        Control::MenuBack,
        Control::Remove,
        Control::CheatMenu,
        Control::DebugMenu,
        Control::Console,
        Control::PeekLeft,
        Control::PeekRight,
        Control::PeekUp,
        Control::PeekDown,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Held/released state of every control at one instant. On the wire it is
/// one `'0'` or `'1'` per control, in [`Control::ALL`] order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlSnapshot {
    held: [bool; Control::COUNT],
}

impl ControlSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, control: Control, held: bool) {
        self.held[control.index()] = held;
    }

    pub fn hold(&self, control: Control) -> bool {
        self.held[control.index()]
    }

    /// Presses the movement and action controls at random, like a player
    /// mashing buttons. Menu controls stay released.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut snapshot = Self::new();
        for control in [
            Control::Left,
            Control::Right,
            Control::Up,
            Control::Down,
            Control::Jump,
            Control::Action,
        ] {
            snapshot.set(control, rng.gen_bool(0.3));
        }
        snapshot
    }

    pub fn to_wire(&self) -> String {
        self.held
            .iter()
            .map(|&held| if held { '1' } else { '0' })
            .collect()
    }
}

impl fmt::Display for ControlSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl FromStr for ControlSnapshot {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Control::COUNT {
            return Err(AppError::InvalidValue(format!(
                "control state has {} entries, expected {}",
                s.len(),
                Control::COUNT
            )));
        }
        let mut snapshot = Self::new();
        for (i, c) in s.chars().enumerate() {
            snapshot.held[i] = match c {
                '0' => false,
                '1' => true,
                other => {
                    return Err(AppError::InvalidValue(format!(
                        "control state contains {:?}",
                        other
                    )))
                }
            };
        }
        Ok(snapshot)
    }
}
