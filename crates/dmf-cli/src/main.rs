mod args;
mod functors;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use dmf_common::error::{MfError, Result};
use dmf_common::rng::SplitMix64;
use dmf_common::trace::Trace;
use dmf_engine::als::{als_update_h, als_update_w, gkl_update_h, gkl_update_w, gnmf_update_h, gnmf_update_w, AlsRegularize};
use dmf_engine::asgd::{run_asgd_epoch, AsgdJob, AsgdNode};
use dmf_engine::balance::{balance, BalanceMethod, NormWeighting};
use dmf_engine::decay::Decay;
use dmf_engine::driver;
use dmf_engine::dsgd::{run_dsgd_epoch, DsgdJob};
use dmf_engine::dsgdpp::{run_dsgdpp_epoch, DsgdPlusPlusJob};
use dmf_engine::job::{Job, KernelChoice};
use dmf_engine::loss::raw_nzsl_on;
use dmf_engine::order::PointOrder;
use dmf_engine::stratified_psgd::StratifiedLayout;
use dmf_engine::stratum::{compute_dsgdpp_schedule, compute_schedule, StratumOrder};
use dmf_engine::update::{Regularize, Update, UpdateAbs, UpdateTruncate};
use dmf_matrix::distributed::default_offsets;
use dmf_matrix::io::{read_matrix, write_matrix_binary, AnyMatrix};
use dmf_matrix::random::{RandomMatrixDescriptor, ValueDist};
use dmf_matrix::{Dense, FactorizationData, Order as DenseOrder, SparseCoo};

use args::{parse_functor, parse_truncate_range, BalanceArg, BalanceMethodArg, Cli, KernelArg, SgdOrderArg, StratumOrderArg};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            ExitCode::FAILURE
        }
    }
}

fn read_sparse(path: &Path) -> Result<SparseCoo> {
    match read_matrix(path)? {
        AnyMatrix::Sparse(s) => Ok(s),
        AnyMatrix::Dense(_) => Err(MfError::Config(format!("{}: expected a sparse matrix", path.display()))),
    }
}

fn read_dense(path: &Path) -> Result<Dense> {
    match read_matrix(path)? {
        AnyMatrix::Dense(d) => Ok(d),
        AnyMatrix::Sparse(_) => Err(MfError::Config(format!("{}: expected a dense matrix", path.display()))),
    }
}

fn default_descriptor(cli: &Cli, rows: usize, cols: usize) -> RandomMatrixDescriptor {
    RandomMatrixDescriptor {
        size1: rows,
        size2: cols,
        blocks1: 1,
        blocks2: 1,
        rank: cli.rank,
        nnz: 0,
        nnz_test: 0,
        values_dist: ValueDist::Uniform { lo: -0.1, hi: 0.1 },
        noise_dist: None,
        parent_seed: cli.seed,
    }
}

fn run(cli: Cli) -> Result<()> {
    if cli.rank == 0 {
        return Err(MfError::Config("--rank must be positive".into()));
    }
    if matches!(cli.kernel, KernelArg::Dsgd | KernelArg::DsgdPlusPlus | KernelArg::Asgd) && parse_functor(&cli.decay)?.name == "Auto" {
        return Err(MfError::Config(
            "Auto decay is not supported with --kernel dsgd/dsgd-plus-plus/asgd in this CLI".into(),
        ));
    }

    let v = read_sparse(&cli.input_file)?;
    let test_v = cli.input_test_file.as_deref().map(read_sparse).transpose()?;

    let needs_column_major = matches!(cli.kernel, KernelArg::Als | KernelArg::Gnmf | KernelArg::Gkl);
    let vc = if needs_column_major {
        Some(SparseCoo::from_triples_unsorted(v.rows(), v.cols(), v.triples().collect(), false))
    } else {
        None
    };

    let w = match &cli.input_row_file {
        Some(path) => read_dense(path)?,
        None => default_descriptor(&cli, v.rows(), v.cols()).generate_w()?,
    };
    let h = match &cli.input_col_file {
        Some(path) => read_dense(path)?,
        None => default_descriptor(&cli, v.rows(), v.cols()).generate_h()?,
    };

    let mut data = FactorizationData::new(v, vc, w, h, cli.tasks_per_rank.max(1));

    let update_spec = parse_functor(&cli.update)?;
    let regularize_spec = parse_functor(&cli.regularize)?;
    let loss_spec = parse_functor(&cli.loss)?;
    let decay_spec = parse_functor(&cli.decay)?;

    let mut update = functors::build_update(&update_spec)?;
    if cli.abs {
        update = Arc::new(UpdateAbs(update));
    }
    if let Some(range) = &cli.truncate {
        let (lo, hi) = parse_truncate_range(range)?;
        update = Arc::new(UpdateTruncate { inner: update, lo, hi });
    }
    let regularize = functors::build_regularize(&regularize_spec, &data)?;
    let loss_fn = functors::build_loss(&loss_spec)?;

    let order = match cli.sgd_order {
        SgdOrderArg::Seq => PointOrder::Seq,
        SgdOrderArg::Wr => PointOrder::Wr,
        SgdOrderArg::Wor => PointOrder::Wor,
    };

    let balance_cfg = match cli.balance {
        BalanceArg::None => None,
        BalanceArg::L2 => Some(NormWeighting::L2),
        BalanceArg::Nzl2 => Some(NormWeighting::Nzl2),
    }
    .map(|weighting| {
        let method = match cli.balance_method {
            BalanceMethodArg::Simple => BalanceMethod::Simple,
            BalanceMethodArg::Optimal => BalanceMethod::Optimal,
        };
        (method, weighting)
    });

    let mut rng = SplitMix64::new(cli.seed);

    let trace = match cli.kernel {
        KernelArg::Dsgd => {
            let mut decay = functors::build_decay(&decay_spec)?;
            run_dsgd(&cli, &mut data, update, regularize, order, decay.as_mut(), &mut rng, test_v.as_ref())?
        }
        KernelArg::DsgdPlusPlus => {
            let mut decay = functors::build_decay(&decay_spec)?;
            run_dsgdpp(&cli, &mut data, update, regularize, order, decay.as_mut(), &mut rng, test_v.as_ref())?
        }
        KernelArg::Asgd => {
            let mut decay = functors::build_decay(&decay_spec)?;
            run_asgd(&cli, &mut data, update, regularize, order, decay.as_mut(), &mut rng, test_v.as_ref())?
        }
        _ => {
            let als_regularize = match regularize_spec.name.as_str() {
                "Nzl2" => AlsRegularize::NzL2(*regularize_spec.args.first().unwrap_or(&0.0)),
                _ => AlsRegularize::L2(*regularize_spec.args.first().unwrap_or(&0.0)),
            };
            let kernel = match cli.kernel {
                KernelArg::Psgd => KernelChoice::Psgd { shuffle: dmf_engine::psgd::PsgdShuffle::Sequential, tasks: cli.tasks_per_rank.max(1) },
                KernelArg::StratifiedPsgd => {
                    let b = cli.tasks_per_rank.max(1);
                    KernelChoice::StratifiedPsgd { layout: StratifiedLayout::build(&data.v, b), tasks: b }
                }
                KernelArg::Als => KernelChoice::Als { regularize: als_regularize },
                KernelArg::Gnmf => KernelChoice::Gnmf,
                KernelArg::Gkl => KernelChoice::Gkl,
                KernelArg::Dsgd | KernelArg::DsgdPlusPlus | KernelArg::Asgd => unreachable!("handled above"),
            };
            let mut job = Job { data, update, regularize, order, kernel, loss_fn, balance: balance_cfg };
            if decay_spec.name == "Auto" {
                let mut auto = functors::build_auto_decay(&decay_spec)?;
                let t = run_with_auto_decay(&mut job, cli.epochs, &mut auto, &mut rng, test_v.as_ref());
                data = job.data;
                t
            } else {
                let mut decay = functors::build_decay(&decay_spec)?;
                let t = driver::run(&mut job, cli.epochs, decay.as_mut(), &mut rng, test_v.as_ref());
                data = job.data;
                t
            }
        }
    };

    if let Some(path) = &cli.trace {
        std::fs::write(path, trace.to_r_list(&cli.trace_var))?;
    }
    if let Some(path) = &cli.output_row_file {
        write_matrix_binary(path, &AnyMatrix::Dense(data.w))?;
    }
    if let Some(path) = &cli.output_col_file {
        write_matrix_binary(path, &AnyMatrix::Dense(data.h))?;
    }
    Ok(())
}

/// Runs `epochs` epochs of a single-node kernel under `Auto` decay: each
/// candidate step size is tried against a throwaway clone of `job.data`
/// before the driver commits to one (spec §4.11's `DistributedDecayAuto`,
/// simplified to one process — see DESIGN.md).
fn run_with_auto_decay(
    job: &mut Job,
    epochs: usize,
    auto: &mut dmf_engine::decay::Auto,
    rng: &mut SplitMix64,
    test_v: Option<&SparseCoo>,
) -> Trace {
    use dmf_common::error::DecayOutcome;
    use dmf_common::trace::TraceEntry;
    use std::time::Instant;

    let mut trace = Trace::new();
    let mut previous_loss: Option<f64> = None;
    let mut current_loss = (job.loss_fn)(&job.data).total();

    for epoch in 0..epochs {
        let eval_seed = rng.next_u64();
        let evaluate = |trial_eps: f64| -> f64 {
            let mut probe = clone_data(&job.data);
            apply_kernel_to(&job.kernel, &job.update, &job.regularize, job.order, &mut probe, trial_eps, &mut SplitMix64::new(eval_seed), epoch);
            (job.loss_fn)(&probe).total()
        };
        let eps = match auto.search(previous_loss, current_loss, &evaluate) {
            DecayOutcome::Eps(e) => e,
            DecayOutcome::RetryWithSmallerEps => current_loss,
            DecayOutcome::GiveUp => {
                tracing::warn!(epoch, "auto decay gave up; stopping early");
                break;
            }
        };

        let t_epoch = Instant::now();
        apply_kernel_to(&job.kernel, &job.update, &job.regularize, job.order, &mut job.data, eps, rng, epoch);
        let epoch_dur = t_epoch.elapsed();

        let t_balance = Instant::now();
        let rescale = job.balance.map(|(method, weighting)| balance(&mut job.data, method, weighting));
        let balance_dur = t_balance.elapsed();

        let t_loss = Instant::now();
        let loss_parts = (job.loss_fn)(&job.data);
        let loss_test = test_v.map(|v| raw_nzsl_on(v, &job.data.w, &job.data.h));
        let loss_dur = t_loss.elapsed();

        previous_loss = Some(current_loss);
        current_loss = loss_parts.total();

        let mut entry = TraceEntry::new(epoch, epoch, eps, current_loss)
            .with_phase("epoch", epoch_dur)
            .with_phase("balance", balance_dur)
            .with_phase("loss", loss_dur);
        entry.loss_test = loss_test;
        entry.rescale = rescale;
        entry.add_field("loss.raw", loss_parts.raw);
        entry.add_field("loss.regularizer", loss_parts.regularizer);
        trace.push(entry);
    }

    trace
}

fn clone_data(data: &FactorizationData) -> FactorizationData {
    FactorizationData::new(data.v.clone(), data.vc.clone(), data.w.clone(), data.h.clone(), data.tasks)
}

/// Applies one kernel epoch to `target` in place (used both for the real
/// epoch and for `Auto`'s throwaway trial epochs). Takes `job`'s pieces by
/// separate reference, rather than `&Job`, so the real-epoch call site can
/// pass `&mut job.data` as `target` without borrowing all of `job` at once;
/// `Auto::search`'s evaluator closure (`dyn Fn`, not `FnMut`) only ever sees
/// the read-only pieces, never `job.data` itself, which is why it can probe
/// a throwaway clone without mutating `job`.
#[allow(clippy::too_many_arguments)]
fn apply_kernel_to(
    kernel: &KernelChoice,
    update: &Arc<dyn Update>,
    regularize: &Arc<dyn Regularize>,
    order: PointOrder,
    target: &mut FactorizationData,
    eps: f64,
    rng: &mut SplitMix64,
    epoch: usize,
) {
    match kernel {
        KernelChoice::Psgd { shuffle, tasks } => {
            let psgd_job = dmf_engine::psgd::PsgdJob {
                update: update.clone(),
                regularize: regularize.clone(),
                order,
                shuffle: *shuffle,
                tasks: *tasks,
            };
            let mut carry = None;
            dmf_engine::psgd::run_psgd_epoch(target, &psgd_job, eps, rng, &mut carry);
        }
        KernelChoice::StratifiedPsgd { layout, tasks } => {
            let sp_job = dmf_engine::stratified_psgd::StratifiedPsgdJob {
                update: update.clone(),
                regularize: regularize.clone(),
                tasks: *tasks,
            };
            dmf_engine::stratified_psgd::run_stratified_psgd_epoch(target, layout, &sp_job, eps, rng);
        }
        KernelChoice::Als { regularize: reg } => {
            if epoch % 2 == 0 {
                als_update_w(target, *reg);
            } else {
                als_update_h(target, *reg);
            }
        }
        KernelChoice::Gnmf => {
            if epoch % 2 == 0 {
                gnmf_update_w(target);
            } else {
                gnmf_update_h(target);
            }
        }
        KernelChoice::Gkl => {
            if epoch % 2 == 0 {
                gkl_update_w(target);
            } else {
                gkl_update_h(target);
            }
        }
    }
    if !matches!(kernel, KernelChoice::Als { .. } | KernelChoice::Gnmf | KernelChoice::Gkl) {
        dmf_engine::sgd::run_regularize(target, regularize.as_ref(), eps);
    }
}

#[allow(clippy::too_many_arguments)]
fn run_dsgd(
    cli: &Cli,
    data: &mut FactorizationData,
    update: Arc<dyn Update>,
    regularize: Arc<dyn Regularize>,
    order: PointOrder,
    decay: &mut dyn Decay,
    rng: &mut SplitMix64,
    test_v: Option<&SparseCoo>,
) -> Result<Trace> {
    use dmf_common::error::DecayOutcome;
    use dmf_common::trace::TraceEntry;
    use parking_lot::Mutex;
    use std::time::Instant;

    let d = cli.tasks_per_rank.max(1);
    if data.v.rows() < d || data.v.cols() < d {
        return Err(MfError::Config("--tasks-per-rank exceeds V's row/column count for dsgd".into()));
    }
    let row_offsets = dmf_matrix::distributed::default_offsets(data.v.rows(), d);
    let col_offsets = dmf_matrix::distributed::default_offsets(data.v.cols(), d);

    let mut v_blocks: Vec<Vec<Arc<SparseCoo>>> = (0..d).map(|_| Vec::with_capacity(d)).collect();
    for b1 in 0..d {
        for b2 in 0..d {
            let mut triples = Vec::new();
            for p in 0..data.v.nnz() {
                let r = data.v.row_at(p) as usize;
                let c = data.v.col_at(p) as usize;
                if r >= row_offsets[b1] && r < row_offsets[b1 + 1] && c >= col_offsets[b2] && c < col_offsets[b2 + 1] {
                    triples.push((r as u32 - row_offsets[b1] as u32, c as u32 - col_offsets[b2] as u32, data.v.val_at(p)));
                }
            }
            v_blocks[b1].push(Arc::new(SparseCoo::from_triples_unsorted(
                row_offsets[b1 + 1] - row_offsets[b1],
                col_offsets[b2 + 1] - col_offsets[b2],
                triples,
                true,
            )));
        }
    }

    let w_blocks: Vec<Arc<Mutex<Dense>>> = (0..d)
        .map(|b| {
            let rows = row_offsets[b + 1] - row_offsets[b];
            let mut block = Dense::zeros(rows, data.w.cols(), DenseOrder::RowMajor);
            for i in 0..rows {
                block.set_row(i, &data.w.row(row_offsets[b] + i));
            }
            Arc::new(Mutex::new(block))
        })
        .collect();
    let h_blocks: Vec<Arc<Mutex<Dense>>> = (0..d)
        .map(|b| {
            let cols = col_offsets[b + 1] - col_offsets[b];
            let mut block = Dense::zeros(data.h.rows(), cols, DenseOrder::ColMajor);
            for j in 0..cols {
                block.set_col(j, &data.h.col(col_offsets[b] + j));
            }
            Arc::new(Mutex::new(block))
        })
        .collect();

    let nnz1 = Arc::new(data.nnz1.clone());
    let nnz2 = Arc::new(data.nnz2.clone());
    let row_offsets = Arc::new(row_offsets);
    let col_offsets = Arc::new(col_offsets);
    let job = Arc::new(DsgdJob { update, regularize: regularize.clone(), order });

    let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build()?;
    let mut trace = Trace::new();
    let mut previous_loss: Option<f64> = None;
    let mut current_loss = current_dsgd_loss(&v_blocks, &w_blocks, &h_blocks, d);

    for epoch in 0..cli.epochs {
        let eps = match decay.step(epoch, previous_loss, current_loss, rng) {
            DecayOutcome::Eps(e) => e,
            DecayOutcome::RetryWithSmallerEps => current_loss,
            DecayOutcome::GiveUp => break,
        };

        let stratum_order = match cli.stratum_order {
            StratumOrderArg::Seq => StratumOrder::Seq,
            StratumOrderArg::Rseq => StratumOrder::Rseq,
            StratumOrderArg::Wr => StratumOrder::Wr,
            StratumOrderArg::Wor => StratumOrder::Wor,
            StratumOrderArg::Cowor => StratumOrder::Cowor,
        };
        let schedule = compute_schedule(d, 1, stratum_order, rng);

        let t_epoch = Instant::now();
        runtime.block_on(run_dsgd_epoch(
            &schedule, &v_blocks, &w_blocks, &h_blocks, &nnz1, &nnz2, &row_offsets, &col_offsets, &job, eps, rng.next_u64(),
        ))?;
        let epoch_dur = t_epoch.elapsed();

        previous_loss = Some(current_loss);
        current_loss = current_dsgd_loss(&v_blocks, &w_blocks, &h_blocks, d);
        let loss_test = test_v.map(|v| {
            let w = stitch_rows(&w_blocks);
            let h = stitch_cols(&h_blocks);
            raw_nzsl_on(v, &w, &h)
        });

        let mut entry = TraceEntry::new(epoch, epoch, eps, current_loss).with_phase("epoch", epoch_dur);
        entry.loss_test = loss_test;
        trace.push(entry);
    }

    data.w = stitch_rows(&w_blocks);
    data.h = stitch_cols(&h_blocks);
    Ok(trace)
}

/// As `run_dsgd`, but over DSGD++'s `d` row-blocks x `2*d` column
/// half-blocks grid (spec §4.5/§4.6).
#[allow(clippy::too_many_arguments)]
fn run_dsgdpp(
    cli: &Cli,
    data: &mut FactorizationData,
    update: Arc<dyn Update>,
    regularize: Arc<dyn Regularize>,
    order: PointOrder,
    decay: &mut dyn Decay,
    rng: &mut SplitMix64,
    test_v: Option<&SparseCoo>,
) -> Result<Trace> {
    use dmf_common::error::DecayOutcome;
    use dmf_common::trace::TraceEntry;
    use parking_lot::Mutex;
    use std::time::Instant;

    let d = cli.tasks_per_rank.max(1);
    let half_blocks = 2 * d;
    if data.v.rows() < d || data.v.cols() < half_blocks {
        return Err(MfError::Config("--tasks-per-rank exceeds V's row/column count for dsgd++".into()));
    }
    let row_offsets = dmf_matrix::distributed::default_offsets(data.v.rows(), d);
    let col_offsets = dmf_matrix::distributed::default_offsets(data.v.cols(), half_blocks);

    let mut v_blocks: Vec<Vec<Arc<SparseCoo>>> = (0..d).map(|_| Vec::with_capacity(half_blocks)).collect();
    for b1 in 0..d {
        for b2 in 0..half_blocks {
            let mut triples = Vec::new();
            for p in 0..data.v.nnz() {
                let r = data.v.row_at(p) as usize;
                let c = data.v.col_at(p) as usize;
                if r >= row_offsets[b1] && r < row_offsets[b1 + 1] && c >= col_offsets[b2] && c < col_offsets[b2 + 1] {
                    triples.push((r as u32 - row_offsets[b1] as u32, c as u32 - col_offsets[b2] as u32, data.v.val_at(p)));
                }
            }
            v_blocks[b1].push(Arc::new(SparseCoo::from_triples_unsorted(
                row_offsets[b1 + 1] - row_offsets[b1],
                col_offsets[b2 + 1] - col_offsets[b2],
                triples,
                true,
            )));
        }
    }

    let w_blocks: Vec<Arc<Mutex<Dense>>> = (0..d)
        .map(|b| {
            let rows = row_offsets[b + 1] - row_offsets[b];
            let mut block = Dense::zeros(rows, data.w.cols(), DenseOrder::RowMajor);
            for i in 0..rows {
                block.set_row(i, &data.w.row(row_offsets[b] + i));
            }
            Arc::new(Mutex::new(block))
        })
        .collect();
    let h_blocks: Vec<Arc<Mutex<Dense>>> = (0..half_blocks)
        .map(|b| {
            let cols = col_offsets[b + 1] - col_offsets[b];
            let mut block = Dense::zeros(data.h.rows(), cols, DenseOrder::ColMajor);
            for j in 0..cols {
                block.set_col(j, &data.h.col(col_offsets[b] + j));
            }
            Arc::new(Mutex::new(block))
        })
        .collect();

    let nnz1 = Arc::new(data.nnz1.clone());
    let nnz2 = Arc::new(data.nnz2.clone());
    let row_offsets = Arc::new(row_offsets);
    let col_offsets = Arc::new(col_offsets);
    let job = Arc::new(DsgdPlusPlusJob { update, regularize: regularize.clone(), order });

    let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build()?;
    let mut trace = Trace::new();
    let mut previous_loss: Option<f64> = None;
    let mut current_loss = current_dsgdpp_loss(&v_blocks, &w_blocks, &h_blocks, d, half_blocks);

    for epoch in 0..cli.epochs {
        let eps = match decay.step(epoch, previous_loss, current_loss, rng) {
            DecayOutcome::Eps(e) => e,
            DecayOutcome::RetryWithSmallerEps => current_loss,
            DecayOutcome::GiveUp => break,
        };

        let stratum_order = match cli.stratum_order {
            StratumOrderArg::Seq => StratumOrder::Seq,
            StratumOrderArg::Rseq => StratumOrder::Rseq,
            StratumOrderArg::Wr => StratumOrder::Wr,
            StratumOrderArg::Wor => StratumOrder::Wor,
            StratumOrderArg::Cowor => StratumOrder::Cowor,
        };
        let schedule = compute_dsgdpp_schedule(d, 1, stratum_order, rng);

        let t_epoch = Instant::now();
        runtime.block_on(run_dsgdpp_epoch(
            &schedule, &v_blocks, &w_blocks, &h_blocks, &nnz1, &nnz2, &row_offsets, &col_offsets, &job, eps, rng.next_u64(),
        ))?;
        let epoch_dur = t_epoch.elapsed();

        previous_loss = Some(current_loss);
        current_loss = current_dsgdpp_loss(&v_blocks, &w_blocks, &h_blocks, d, half_blocks);
        let loss_test = test_v.map(|v| {
            let w = stitch_rows(&w_blocks);
            let h = stitch_cols(&h_blocks);
            raw_nzsl_on(v, &w, &h)
        });

        let mut entry = TraceEntry::new(epoch, epoch, eps, current_loss).with_phase("epoch", epoch_dur);
        entry.loss_test = loss_test;
        trace.push(entry);
    }

    data.w = stitch_rows(&w_blocks);
    data.h = stitch_cols(&h_blocks);
    Ok(trace)
}

fn current_dsgd_loss(v_blocks: &[Vec<Arc<SparseCoo>>], w_blocks: &[Arc<parking_lot::Mutex<Dense>>], h_blocks: &[Arc<parking_lot::Mutex<Dense>>], d: usize) -> f64 {
    let mut loss = 0.0;
    for b1 in 0..d {
        let w = w_blocks[b1].lock();
        for b2 in 0..d {
            let h = h_blocks[b2].lock();
            loss += raw_nzsl_on(&v_blocks[b1][b2], &w, &h);
        }
    }
    loss
}

/// As `current_dsgd_loss`, but over DSGD++'s `d` row-blocks x `half_blocks`
/// (`2*d`) column half-blocks grid.
fn current_dsgdpp_loss(
    v_blocks: &[Vec<Arc<SparseCoo>>],
    w_blocks: &[Arc<parking_lot::Mutex<Dense>>],
    h_blocks: &[Arc<parking_lot::Mutex<Dense>>],
    d: usize,
    half_blocks: usize,
) -> f64 {
    let mut loss = 0.0;
    for b1 in 0..d {
        let w = w_blocks[b1].lock();
        for b2 in 0..half_blocks {
            let h = h_blocks[b2].lock();
            loss += raw_nzsl_on(&v_blocks[b1][b2], &w, &h);
        }
    }
    loss
}

fn stitch_rows(blocks: &[Arc<parking_lot::Mutex<Dense>>]) -> Dense {
    let rank = blocks[0].lock().cols();
    let rows: usize = blocks.iter().map(|b| b.lock().rows()).sum();
    let mut out = Dense::zeros(rows, rank, DenseOrder::RowMajor);
    let mut offset = 0;
    for b in blocks {
        let block = b.lock();
        for i in 0..block.rows() {
            out.set_row(offset + i, &block.row(i));
        }
        offset += block.rows();
    }
    out
}

fn stitch_cols(blocks: &[Arc<parking_lot::Mutex<Dense>>]) -> Dense {
    let rank = blocks[0].lock().rows();
    let cols: usize = blocks.iter().map(|b| b.lock().cols()).sum();
    let mut out = Dense::zeros(rank, cols, DenseOrder::ColMajor);
    let mut offset = 0;
    for b in blocks {
        let block = b.lock();
        for j in 0..block.cols() {
            out.set_col(offset + j, &block.col(j));
        }
        offset += block.cols();
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn run_asgd(
    cli: &Cli,
    data: &mut FactorizationData,
    update: Arc<dyn Update>,
    regularize: Arc<dyn Regularize>,
    order: PointOrder,
    decay: &mut dyn Decay,
    rng: &mut SplitMix64,
    test_v: Option<&SparseCoo>,
) -> Result<Trace> {
    use dmf_common::error::DecayOutcome;
    use dmf_common::trace::TraceEntry;
    use std::time::Instant;

    let nodes_count = cli.tasks_per_rank.max(1);
    if data.v.rows() < nodes_count {
        return Err(MfError::Config("--tasks-per-rank exceeds V's row count for asgd".into()));
    }
    let row_splits = default_offsets(data.v.rows(), nodes_count);

    let mut nodes: Vec<AsgdNode> = Vec::with_capacity(nodes_count);
    for k in 0..nodes_count {
        let row_begin = row_splits[k];
        let row_end = row_splits[k + 1];
        let mut triples = Vec::new();
        for p in 0..data.v.nnz() {
            let r = data.v.row_at(p) as usize;
            if r >= row_begin && r < row_end {
                triples.push((r as u32 - row_begin as u32, data.v.col_at(p), data.v.val_at(p)));
            }
        }
        let v_local = SparseCoo::from_triples_unsorted(row_end - row_begin, data.v.cols(), triples, true);
        let mut w_local = Dense::zeros(row_end - row_begin, data.w.cols(), DenseOrder::RowMajor);
        for i in 0..row_end - row_begin {
            w_local.set_row(i, &data.w.row(row_begin + i));
        }
        let node_data = FactorizationData::new(v_local, None, w_local, data.h.clone(), 1);
        nodes.push(AsgdNode::new(node_data));
    }

    let mut master = data.h.clone();
    let job = AsgdJob { update, regularize, order, tasks_per_node: 1, average_deltas: true };

    let mut trace = Trace::new();
    let mut previous_loss: Option<f64> = None;
    let mut current_loss = current_asgd_loss(&nodes);

    for epoch in 0..cli.epochs {
        let eps = match decay.step(epoch, previous_loss, current_loss, rng) {
            DecayOutcome::Eps(e) => e,
            DecayOutcome::RetryWithSmallerEps => current_loss,
            DecayOutcome::GiveUp => break,
        };

        let t_epoch = Instant::now();
        run_asgd_epoch(&mut nodes, &mut master, &job, eps, rng);
        let epoch_dur = t_epoch.elapsed();

        previous_loss = Some(current_loss);
        current_loss = current_asgd_loss(&nodes);
        let loss_test = test_v.map(|v| {
            let w = stitch_node_rows(&nodes);
            raw_nzsl_on(v, &w, &master)
        });

        let mut entry = TraceEntry::new(epoch, epoch, eps, current_loss).with_phase("epoch", epoch_dur);
        entry.loss_test = loss_test;
        trace.push(entry);
    }

    data.w = stitch_node_rows(&nodes);
    data.h = master;
    Ok(trace)
}

fn current_asgd_loss(nodes: &[AsgdNode]) -> f64 {
    nodes.iter().map(|n| raw_nzsl_on(&n.data.v, &n.data.w, &n.data.h)).sum()
}

fn stitch_node_rows(nodes: &[AsgdNode]) -> Dense {
    let rank = nodes[0].data.w.cols();
    let rows: usize = nodes.iter().map(|n| n.data.w.rows()).sum();
    let mut out = Dense::zeros(rows, rank, DenseOrder::RowMajor);
    let mut offset = 0;
    for n in nodes {
        for i in 0..n.data.w.rows() {
            out.set_row(offset + i, &n.data.w.row(i));
        }
        offset += n.data.w.rows();
    }
    out
}
