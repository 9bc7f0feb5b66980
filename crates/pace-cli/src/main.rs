#![forbid(unsafe_code)]

#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::collections::BTreeMap;
    use std::fs::File;
    use std::io::{BufWriter, Write};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use anyhow::{bail, Context, Result};
    use clap::{Parser, ValueEnum};
    use pace_cpus::{
        CpuInfo, CpusConfig, DriftInfo, ExecContext, ExitReason, IcountOptions, IcountSettings,
        MachineBuilder, QuantumCpuStats, QuantumOptions, QuantumSample,
        QuantumSettings, RunState, TcgExecutor, ThreadMode, ThrottleStats,
    };
    use serde::Serialize;
    use tracing_subscriber::EnvFilter;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
    enum EngineArg {
        /// Software execution with a synthetic instruction stream.
        Tcg,
        /// No execution; vCPU threads only service queued work.
        Qtest,
    }

    #[derive(Debug, Parser)]
    #[command(about = "Boot a synthetic multi-vCPU machine and report scheduler statistics")]
    pub struct Args {
        /// Number of vCPUs to create.
        #[arg(long, default_value_t = 2)]
        cpus: usize,

        #[arg(long, value_enum, default_value_t = EngineArg::Tcg)]
        engine: EngineArg,

        /// Software thread model: `single` (round-robin) or `multi` (one thread per vCPU).
        #[arg(long)]
        thread: Option<String>,

        /// Instruction counting options, e.g. `shift=3,align=off,sleep=on` or `shift=auto`.
        #[arg(long)]
        icount: Option<String>,

        /// Instruction quantum options, e.g. `core=10K,record=1M,step=100K,file=q.jsonl`.
        #[arg(long)]
        quantum: Option<String>,

        /// Throttle percentage (0 disables).
        #[arg(long, default_value_t = 0)]
        throttle: u32,

        /// Round-robin kick period in milliseconds.
        #[arg(long)]
        kick_period_ms: Option<u64>,

        /// Host time to run before stopping the VM.
        #[arg(long, default_value_t = 500)]
        run_ms: u64,

        /// Instructions the synthetic engine retires per step.
        #[arg(long, default_value_t = 10_000)]
        chunk: u64,

        /// Host time the synthetic engine spends per step, in microseconds.
        #[arg(long, default_value_t = 100)]
        step_us: u64,

        /// Warp virtual time to this many nanoseconds (qtest engine with icount only).
        #[arg(long)]
        warp_ns: Option<i64>,

        /// Print the resolved configuration as JSON and exit.
        #[arg(long)]
        print_config: bool,

        /// Print the report as JSON instead of text.
        #[arg(long)]
        json: bool,
    }

    /// Stands in for a translating engine: retires a fixed block per step until kicked or out
    /// of budget.
    struct SyntheticExecutor {
        chunk: u64,
        step: Duration,
    }

    impl TcgExecutor for SyntheticExecutor {
        fn exec(&self, ctx: &mut ExecContext<'_>) -> ExitReason {
            while !ctx.should_exit() {
                if ctx.retire(self.chunk) < self.chunk {
                    break;
                }
                if !self.step.is_zero() {
                    std::thread::sleep(self.step);
                }
            }
            ExitReason::Other
        }
    }

    #[derive(Debug, Serialize)]
    struct Report {
        run_state: RunState,
        elapsed_ms: u128,
        virtual_ns: i64,
        total_instructions: u64,
        mttcg: bool,
        cpus: Vec<CpuInfo>,
        throttle: ThrottleStats,
        drift: Option<DriftInfo>,
        quantum: BTreeMap<usize, QuantumCpuStats>,
    }

    pub fn main() -> Result<()> {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();

        let args = Args::parse();
        let config = build_config(&args)?;

        if args.print_config {
            println!("{}", serde_json::to_string_pretty(&config)?);
            return Ok(());
        }
        if args.cpus == 0 {
            bail!("--cpus must be at least 1");
        }

        let mut builder = MachineBuilder::new(config.clone());
        if args.engine == EngineArg::Tcg {
            builder = builder.tcg(Arc::new(SyntheticExecutor {
                chunk: args.chunk.max(1),
                step: Duration::from_micros(args.step_us),
            }));
        }
        let machine = builder.build().context("invalid scheduler configuration")?;

        for _ in 0..args.cpus {
            machine.init_vcpu().context("failed to create vCPU")?;
        }
        machine
            .start_main_loop()
            .context("failed to start main loop")?;
        tracing::info!(cpus = args.cpus, engine = ?args.engine, "starting machine");

        let start = Instant::now();
        machine.vm_start();
        if args.throttle > 0 {
            machine.cpu_throttle_set(args.throttle);
        }
        if let Some(dest) = args.warp_ns {
            machine
                .lock()
                .qtest_clock_warp(dest)
                .context("clock warp failed")?;
        }
        std::thread::sleep(Duration::from_millis(args.run_ms));
        machine.vm_stop(RunState::Paused);
        let elapsed_ms = start.elapsed().as_millis();

        let report = {
            let mut bql = machine.lock();
            Report {
                run_state: bql.run_state(),
                elapsed_ms,
                virtual_ns: bql.get_ticks(),
                total_instructions: machine.total_instructions(),
                mttcg: machine.mttcg_enabled(),
                cpus: bql.query_cpus(),
                throttle: machine.throttle_stats(),
                drift: bql.dump_drift_info(),
                quantum: machine.quantum_cpu_stats(),
            }
        };

        if let Some(settings) = machine.quantum_settings() {
            if let Some(path) = &settings.file {
                write_samples(path, &machine.quantum_samples())?;
            }
        }
        machine.shutdown();

        if args.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_report(&report);
        }
        Ok(())
    }

    fn build_config(args: &Args) -> Result<CpusConfig> {
        let mut config = CpusConfig::default();
        if let Some(thread) = &args.thread {
            config.thread = Some(thread.parse::<ThreadMode>()?);
        }
        if let Some(opts) = &args.icount {
            let opts = IcountOptions::parse(opts).context("failed to parse --icount")?;
            config.icount = IcountSettings::configure(&opts)?;
        }
        if let Some(opts) = &args.quantum {
            let opts = QuantumOptions::parse(opts).context("failed to parse --quantum")?;
            config.quantum = Some(QuantumSettings::configure(&opts)?);
        }
        if let Some(ms) = args.kick_period_ms {
            config.kick_period_ns = i64::try_from(ms)
                .ok()
                .and_then(|ms| ms.checked_mul(1_000_000))
                .context("kick period overflow")?;
        }
        config.validate()?;
        Ok(config)
    }

    fn write_samples(path: &Path, samples: &[QuantumSample]) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("failed to create quantum record file: {}", path.display()))?;
        let mut out = BufWriter::new(file);
        for sample in samples {
            serde_json::to_writer(&mut out, sample)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(())
    }

    fn print_report(report: &Report) {
        println!(
            "state={:?} elapsed={}ms virtual={}ns instructions={} mttcg={}",
            report.run_state,
            report.elapsed_ms,
            report.virtual_ns,
            report.total_instructions,
            report.mttcg
        );
        for cpu in &report.cpus {
            println!(
                "  cpu{} {:?} {:?} executed={} kicks={} thread={}",
                cpu.index,
                cpu.backend,
                cpu.state,
                cpu.executed,
                cpu.kicks,
                cpu.thread.as_deref().unwrap_or("-")
            );
        }
        if report.throttle.percentage > 0 || report.throttle.scheduled_sleeps > 0 {
            println!(
                "  throttle {}% sleeps={} slept={}ns",
                report.throttle.percentage,
                report.throttle.scheduled_sleeps,
                report.throttle.slept_ns
            );
        }
        if let Some(drift) = &report.drift {
            println!("  drift {}ms", drift.host_minus_guest_ms);
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn main() -> anyhow::Result<()> {
    native::main()
}
