//! esn-escalation
//!
//! The per-user escalation state machine. `step` is a total, deterministic
//! function over `(config, event, now)`; it performs no IO and mints no
//! randomness. Callers (the store's compound operations) hold the user's
//! row lock while applying its output.
//!
//! # Transition table
//!
//! | From \ Event | Confirm | Miss (stale) | Miss (fresh) | GraceTimeout | Pause | Resume | ForceCheckIn | AdminTrigger |
//! |--------------|---------|--------------|--------------|--------------|-------|--------|--------------|--------------|
//! | ACTIVE       | reset   | no-op        | GRACE_1 ++   | —            | PAUSED| —      | reset        | TRIGGERED    |
//! | GRACE_1      | reset   | no-op        | GRACE_2 ++   | —            | PAUSED| —      | reset        | TRIGGERED    |
//! | GRACE_2      | reset   | no-op        | GRACE_3 ++   | —            | PAUSED| —      | reset        | TRIGGERED    |
//! | GRACE_3      | reset   | no-op        | GRACE_3 ++   | TRIGGERED    | PAUSED| —      | reset        | TRIGGERED    |
//! | PAUSED       | —       | —            | —            | —            | —     | reset  | reset        | —            |
//! | TRIGGERED    | —       | —            | —            | —            | —     | —      | —            | —            |
//!
//! "—" cells return the config unchanged with no effects. A `Miss` is stale
//! when its `expected_missed_count` differs from the live counter: the user
//! confirmed (or an admin intervened) after the escalation was enqueued, and
//! executing it must be a no-op. TRIGGERED is terminal.

mod step;
mod types;

pub use step::step;
pub use types::{Effect, Event, Step};
