//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Runtime helpers supporting the guard loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Runtime helpers for the gridguard control loop: the periodic guard tick,
//! trigger coalescing and cancellable one-shot timers.

pub mod debounce;
pub mod scheduling;
pub mod timers;

pub use debounce::Debouncer;
pub use scheduling::RateLimiter;
pub use timers::TimerRegistry;
