//! Instruction quantum accounting.
//!
//! Counts retired instructions machine-wide and per vCPU. With `record` configured, a sample
//! of the per-vCPU counts is taken every `step` instructions until `record` instructions have
//! been retired.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::{Locked, Machine, QuantumSettings, RunState};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QuantumCpuStats {
    pub instructions: u64,
    pub slices: u64,
    /// Slices that ran for the full quantum.
    pub quantum_hits: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuantumSample {
    pub total_instructions: u64,
    pub per_cpu: BTreeMap<usize, u64>,
}

#[derive(Debug, Default)]
struct Recorder {
    per_cpu: BTreeMap<usize, QuantumCpuStats>,
    samples: Vec<QuantumSample>,
    next_sample: u64,
}

#[derive(Debug)]
pub(crate) struct QuantumState {
    settings: Option<QuantumSettings>,
    total: AtomicU64,
    paused: AtomicBool,
    recorder: Mutex<Recorder>,
}

impl QuantumState {
    pub(crate) fn new(settings: Option<QuantumSettings>) -> Self {
        let next_sample = settings.as_ref().map_or(0, |s| s.step);
        Self {
            settings,
            total: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            recorder: Mutex::new(Recorder {
                next_sample,
                ..Recorder::default()
            }),
        }
    }

    pub(crate) fn record(&self, index: usize, executed: u64) {
        let total = self.total.fetch_add(executed, Ordering::SeqCst) + executed;
        let Some(settings) = &self.settings else {
            return;
        };

        let mut recorder = self.recorder.lock();
        let stats = recorder.per_cpu.entry(index).or_default();
        stats.instructions += executed;
        stats.slices += 1;
        if settings.core > 0 && executed >= settings.core {
            stats.quantum_hits += 1;
        }

        if settings.record == 0 || settings.step == 0 {
            return;
        }
        while recorder.next_sample <= total && recorder.next_sample <= settings.record {
            let sample = QuantumSample {
                total_instructions: recorder.next_sample,
                per_cpu: recorder
                    .per_cpu
                    .iter()
                    .map(|(cpu, stats)| (*cpu, stats.instructions))
                    .collect(),
            };
            recorder.samples.push(sample);
            recorder.next_sample += settings.step;
        }
    }

    pub(crate) fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub(crate) fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }
}

impl Locked<'_> {
    /// Stop the VM at a quantum boundary.
    pub fn quantum_pause(&mut self) {
        self.shared.quantum.set_paused(true);
        self.vm_stop(RunState::Paused);
    }

    pub fn quantum_unpause(&mut self) {
        self.shared.quantum.set_paused(false);
        self.vm_start();
    }
}

impl Machine {
    pub fn quantum_settings(&self) -> Option<&QuantumSettings> {
        self.shared.quantum.settings.as_ref()
    }

    pub fn quantum_pause(&self) {
        self.lock().quantum_pause();
    }

    pub fn quantum_unpause(&self) {
        self.lock().quantum_unpause();
    }

    pub fn quantum_paused(&self) -> bool {
        self.shared.quantum.is_paused()
    }

    /// Instructions retired by every vCPU since start.
    pub fn total_instructions(&self) -> u64 {
        self.shared.quantum.total()
    }

    pub fn set_total_instructions(&self, total: u64) {
        self.shared.quantum.set_total(total);
    }

    pub fn quantum_cpu_stats(&self) -> BTreeMap<usize, QuantumCpuStats> {
        self.shared.quantum.recorder.lock().per_cpu.clone()
    }

    pub fn quantum_samples(&self) -> Vec<QuantumSample> {
        self.shared.quantum.recorder.lock().samples.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn settings(core: u64, record: u64, step: u64) -> QuantumSettings {
        QuantumSettings {
            core,
            record,
            step,
            file: None,
            node: 0,
        }
    }

    #[test]
    fn samples_every_step_until_record() {
        let state = QuantumState::new(Some(settings(100, 250, 100)));
        state.record(0, 100);
        state.record(1, 60);
        state.record(0, 100);
        state.record(1, 100);

        assert_eq!(state.total(), 360);
        let samples = state.recorder.lock().samples.clone();
        assert_eq!(
            samples,
            vec![
                QuantumSample {
                    total_instructions: 100,
                    per_cpu: BTreeMap::from([(0, 100)]),
                },
                QuantumSample {
                    total_instructions: 200,
                    per_cpu: BTreeMap::from([(0, 200), (1, 60)]),
                },
            ]
        );
        let stats = state.recorder.lock().per_cpu.clone();
        assert_eq!(stats[&0].quantum_hits, 2);
        assert_eq!(stats[&1].quantum_hits, 1);
        assert_eq!(stats[&1].slices, 2);
    }

    #[test]
    fn without_settings_only_the_total_moves() {
        let state = QuantumState::new(None);
        state.record(3, 42);
        assert_eq!(state.total(), 42);
        assert!(state.recorder.lock().per_cpu.is_empty());
    }
}
