//! Runs an external coding agent per chat task and streams its output back.
//!
//! A submitted task goes through [`TaskController`], which admits one task
//! per conversation, drives [`ProcessExecutor`] attempts with retries and
//! reclaims leftovers exactly once. Each attempt classifies the agent's
//! line-delimited JSON output, buffers it per category and delivers it
//! through a [`DeliverySink`].

pub mod buffer;
pub mod classifier;
pub mod cleanup;
pub mod commands;
pub mod controller;
pub mod error;
pub mod heartbeat;
pub mod markdown;
pub mod process;
pub mod registry;
pub mod settings;
pub mod sink;
pub mod summary;

pub use {
    buffer::{ContentBuffer, FlushUnit},
    classifier::{Category, Classifier, Event, classify_line},
    cleanup::{ReclaimReport, ReclaimScope, ResourceReclaimer, SystemReclaimer},
    commands::{COMMANDS, RelayDispatcher},
    controller::{TaskController, TaskOutcome},
    error::{Error, Result},
    heartbeat::Heartbeat,
    process::{AgentInvocation, AttemptContext, AttemptOutcome, AttemptReport, ProcessExecutor},
    registry::{ConversationRegistry, LiveAgentGuard, LiveAgents, MemoryEntry, RunGuard},
    settings::RunnerSettings,
    sink::{DeliveryReport, DeliverySettings, DeliverySink},
    summary::summarize,
};
