//! # idlescope - Synchronized Multi-Core Idle-State Measurement
//!
//! idlescope characterizes what processor cores do when they are told to
//! idle: how long they take to wake up, how much energy the package and the
//! cores consume, and how much time each hardware idle sub-state reports.
//! All participating cores start and end every measurement at a mutually
//! agreed instant.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      main (CLI, tokio)                          │
//! │   Args ─▶ MeasurementConfig ─▶ preflight ─▶ select_provider     │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ spawn_blocking
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Orchestrator                               │
//! │                                                                 │
//! │   round ─▶ one pinned thread per core ─▶ join ─▶ validity       │
//! │               │        │                           │            │
//! │               │        ▼                           ▼            │
//! │               │  RendezvousBarrier          redo / accept       │
//! │               │  StopFlag (futex)                  │            │
//! │               ▼                                    ▼            │
//! │        CounterProvider                      ResultSeries        │
//! │    (x86 MSR / arm timer / sim)                     │            │
//! └────────────────────────────────────────────────────┼────────────┘
//!                                                      ▼
//!                      RoundSink (printer thread) / export (JSON, tree)
//! ```
//!
//! ## Module Structure
//!
//! - [`measure`]: the round protocol, wrap-safe counter deltas, validity
//! - [`sync`]: rendezvous barrier and the "measurement ongoing" word
//! - [`provider`]: counter and sleep primitives per architecture
//! - [`results`]: fixed-capacity result series and per-round sinks
//! - [`export`]: JSON and attribute-tree output
//! - [`platform`]: affinity, signal masks, futex, cpuidle, CPU enumeration
//! - [`config`] / [`cli`]: validated configuration and its CLI front end
//! - [`domain`]: identity newtypes and error types
//!
//! ## Typical Usage
//!
//! ```bash
//! # 10 rounds of 100ms with every core halted
//! sudo ./idlescope
//!
//! # Two sleeping cores, the rest polling, results as JSON
//! sudo ./idlescope --idle-cores 2 --export results.json
//!
//! # No root needed: simulated counters
//! ./idlescope --provider sim --no-pin
//! ```

pub mod cli;
pub mod config;
pub mod domain;
pub mod export;
pub mod measure;
pub mod platform;
pub mod preflight;
pub mod provider;
pub mod results;
pub mod sync;
