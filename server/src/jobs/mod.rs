pub mod awareness_reaper;

pub use awareness_reaper::run_awareness_reaper;
