//! Shipwright Harness
//!
//! Deterministic collaborators, fixtures and a seeded simulator for
//! exercising the engine without an LLM, a git host or an evaluator.

#![warn(unreachable_pub)]

pub mod fixtures;
pub mod scripted;
pub mod simulator;

pub use scripted::{MemoryRepository, PublishEvent, RecordingNotifier, ScriptedGenerator, StaticFetcher};
pub use simulator::{run_simulator, SimulatedGenerator, SimulatorConfig, SimulatorReport, SimulatorStats, Violation};
