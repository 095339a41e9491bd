use std::path::PathBuf;

use clap::Parser;

use dmf_common::error::{MfError, Result};

/// Which epoch kernel drives the run (spec §6: the training tools are
/// really one CLI surface differentiated by which kernel is selected).
#[derive(Clone, Copy, Debug, clap::ArgEnum)]
pub enum KernelArg {
    Psgd,
    StratifiedPsgd,
    Dsgd,
    DsgdPlusPlus,
    Asgd,
    Als,
    Gnmf,
    Gkl,
}

#[derive(Clone, Copy, Debug, clap::ArgEnum, PartialEq, Eq)]
pub enum BalanceArg {
    None,
    L2,
    Nzl2,
}

#[derive(Clone, Copy, Debug, clap::ArgEnum)]
pub enum BalanceMethodArg {
    Simple,
    Optimal,
}

#[derive(Clone, Copy, Debug, clap::ArgEnum)]
pub enum SgdOrderArg {
    Seq,
    Wr,
    Wor,
}

#[derive(Clone, Copy, Debug, clap::ArgEnum)]
pub enum StratumOrderArg {
    Seq,
    Rseq,
    Wr,
    Wor,
    Cowor,
}

/// The full training-tool argument surface of spec §6, collapsed into one
/// binary selected by `--kernel` rather than one binary per tool (the
/// source ships `psgdL2`, `dsgd`, `asgd`, ... as separate executables that
/// share this same flag set).
#[derive(Parser, Debug)]
#[clap(name = "dmf", about = "distributed matrix factorization")]
pub struct Cli {
    #[clap(long)]
    pub input_file: PathBuf,
    #[clap(long)]
    pub input_test_file: Option<PathBuf>,
    #[clap(long)]
    pub input_row_file: Option<PathBuf>,
    #[clap(long)]
    pub input_col_file: Option<PathBuf>,
    #[clap(long)]
    pub output_row_file: Option<PathBuf>,
    #[clap(long)]
    pub output_col_file: Option<PathBuf>,
    #[clap(long)]
    pub trace: Option<PathBuf>,
    #[clap(long, default_value = "trace")]
    pub trace_var: String,

    #[clap(long, default_value = "20")]
    pub epochs: usize,
    #[clap(long, default_value = "10")]
    pub rank: usize,
    #[clap(long, default_value = "1")]
    pub tasks_per_rank: usize,
    #[clap(long, default_value = "0")]
    pub seed: u64,

    #[clap(long, arg_enum, default_value = "none")]
    pub balance: BalanceArg,
    #[clap(long, arg_enum, default_value = "simple")]
    pub balance_method: BalanceMethodArg,

    #[clap(long, arg_enum)]
    pub kernel: KernelArg,

    #[clap(long, arg_enum, default_value = "seq")]
    pub sgd_order: SgdOrderArg,
    #[clap(long, arg_enum, default_value = "seq")]
    pub stratum_order: StratumOrderArg,

    #[clap(long, default_value = "Nzsl()")]
    pub update: String,
    #[clap(long, default_value = "None()")]
    pub regularize: String,
    #[clap(long, default_value = "Nzsl()")]
    pub loss: String,
    #[clap(long, default_value = "Constant(0.01)")]
    pub decay: String,

    #[clap(long)]
    pub abs: bool,
    /// `(lo,hi)`.
    #[clap(long)]
    pub truncate: Option<String>,
    /// Accepted for surface compatibility with the source's tools; this
    /// single-process CLI always runs block computations locally rather
    /// than shipping them to a map-reduce cluster, so the flag has no
    /// effect here beyond being recorded (spec §9 open question).
    #[clap(long)]
    pub map_reduce: bool,
}

/// `Name(arg1,arg2,...)` (spec §6). Bare `Name` and `Name()` both parse to
/// an empty argument list.
#[derive(Clone, Debug)]
pub struct FunctorSpec {
    pub name: String,
    pub args: Vec<f64>,
}

pub fn parse_functor(spec: &str) -> Result<FunctorSpec> {
    let spec = spec.trim();
    let Some(open) = spec.find('(') else {
        return Ok(FunctorSpec { name: spec.to_string(), args: Vec::new() });
    };
    let name = spec[..open].trim().to_string();
    let rest = spec[open + 1..]
        .strip_suffix(')')
        .ok_or_else(|| MfError::Config(format!("unterminated functor spec: {spec:?}")))?;
    let args = if rest.trim().is_empty() {
        Vec::new()
    } else {
        rest.split(',')
            .map(|s| {
                s.trim()
                    .parse::<f64>()
                    .map_err(|e| MfError::Config(format!("bad functor argument {s:?} in {spec:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?
    };
    Ok(FunctorSpec { name, args })
}

/// `(lo,hi)` (spec §6 `--truncate`).
pub fn parse_truncate_range(spec: &str) -> Result<(f64, f64)> {
    let inner = spec
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| MfError::Config(format!("--truncate expects (lo,hi), got {spec:?}")))?;
    let mut parts = inner.split(',');
    let lo = parts
        .next()
        .ok_or_else(|| MfError::Config(format!("--truncate missing lo in {spec:?}")))?
        .trim()
        .parse::<f64>()
        .map_err(|e| MfError::Config(e.to_string()))?;
    let hi = parts
        .next()
        .ok_or_else(|| MfError::Config(format!("--truncate missing hi in {spec:?}")))?
        .trim()
        .parse::<f64>()
        .map_err(|e| MfError::Config(e.to_string()))?;
    if parts.next().is_some() {
        return Err(MfError::Config(format!("--truncate expects exactly two fields, got {spec:?}")));
    }
    Ok((lo, hi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_parses_with_no_arguments() {
        let f = parse_functor("Nzsl").unwrap();
        assert_eq!(f.name, "Nzsl");
        assert!(f.args.is_empty());
    }

    #[test]
    fn parenthesised_floats_parse_in_order() {
        let f = parse_functor("NzslNzl2(0.01)").unwrap();
        assert_eq!(f.name, "NzslNzl2");
        assert_eq!(f.args, vec![0.01]);
    }

    #[test]
    fn multiple_arguments_parse_in_order() {
        let f = parse_functor("BiasedNzslNzl2(0.1, 0.2, 0.3, 0.4)").unwrap();
        assert_eq!(f.args, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn unterminated_functor_spec_is_a_config_error() {
        assert!(parse_functor("Nzsl(0.1").is_err());
    }

    #[test]
    fn truncate_range_parses_both_bounds() {
        assert_eq!(parse_truncate_range("(-1,1)").unwrap(), (-1.0, 1.0));
    }
}
