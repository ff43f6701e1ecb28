use std::fmt;

/// Steps of a mount, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Locate,
    ReadSuper,
    JournalInfo,
    Eflush,
    Status,
    Replay,
    ReloadSuper,
    KeyCheck,
    OidInit,
    TreeInit,
    RecoverFields,
    UsedBlocks,
    SpaceInit,
    PinSuper,
}

impl Stage {
    pub const ALL: [Stage; 14] = [
        Stage::Locate,
        Stage::ReadSuper,
        Stage::JournalInfo,
        Stage::Eflush,
        Stage::Status,
        Stage::Replay,
        Stage::ReloadSuper,
        Stage::KeyCheck,
        Stage::OidInit,
        Stage::TreeInit,
        Stage::RecoverFields,
        Stage::UsedBlocks,
        Stage::SpaceInit,
        Stage::PinSuper,
    ];

    /// One-based position in the mount sequence.
    pub fn number(self) -> usize {
        self as usize + 1
    }

    /// Whether a completed stage leaves something behind to undo.
    ///
    /// The tree handle is opened at `KeyCheck` and torn down once from there;
    /// `TreeInit` only hands it the root.
    pub fn has_rollback(self) -> bool {
        matches!(
            self,
            Stage::JournalInfo
                | Stage::Eflush
                | Stage::Status
                | Stage::KeyCheck
                | Stage::SpaceInit
                | Stage::PinSuper
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Locate => "locate",
            Stage::ReadSuper => "read super",
            Stage::JournalInfo => "journal info",
            Stage::Eflush => "emergency flush",
            Stage::Status => "status",
            Stage::Replay => "journal replay",
            Stage::ReloadSuper => "reload super",
            Stage::KeyCheck => "key check",
            Stage::OidInit => "oid init",
            Stage::TreeInit => "tree init",
            Stage::RecoverFields => "recover fields",
            Stage::UsedBlocks => "used blocks",
            Stage::SpaceInit => "space init",
            Stage::PinSuper => "pin super",
        };
        write!(f, "{} ({})", self.number(), name)
    }
}
