use std::sync::Arc;

use dmf_matrix::FactorizationData;

use crate::als::AlsRegularize;
use crate::balance::{BalanceMethod, NormWeighting};
use crate::loss::LossParts;
use crate::order::PointOrder;
use crate::psgd::PsgdShuffle;
use crate::stratified_psgd::StratifiedLayout;
use crate::update::{Regularize, Update};

/// Which single-node epoch kernel `driver::run_epoch` dispatches to (spec
/// §4.13 step 2's "dispatches to the chosen SGD/ALS kernel"). DSGD, DSGD++,
/// and ASGD are driven separately (`dsgd`/`dsgdpp`/`asgd` modules) rather
/// than through `Job`: all three operate over a block grid or a per-node
/// state array instead of one `FactorizationData`, a shape `Job` does not
/// try to generalise over (see DESIGN.md).
pub enum KernelChoice {
    Psgd { shuffle: PsgdShuffle, tasks: usize },
    StratifiedPsgd { layout: StratifiedLayout, tasks: usize },
    Als { regularize: AlsRegularize },
    Gnmf,
    Gkl,
}

/// The derived, ready-to-run unit the driver loop consumes (spec §3:
/// "the core derives a Job object from the parsed options"). Bundles the
/// factorization state with the functors and kernel choice fixed at
/// startup, so the driver loop itself stays generic over which kernel and
/// which update/loss functor were selected.
pub struct Job {
    pub data: FactorizationData,
    pub update: Arc<dyn Update>,
    pub regularize: Arc<dyn Regularize>,
    pub order: PointOrder,
    pub kernel: KernelChoice,
    pub loss_fn: Box<dyn Fn(&FactorizationData) -> LossParts>,
    pub balance: Option<(BalanceMethod, NormWeighting)>,
}
