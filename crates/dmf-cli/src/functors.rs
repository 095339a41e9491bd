use std::sync::Arc;

use dmf_common::error::{MfError, Result};
use dmf_engine::decay::{Auto, BoldDriver, Constant, Decay, Sequential};
use dmf_engine::loss::{self, LossParts};
use dmf_engine::update::{
    BiasedNzslNzl2, Gkl, Gnmf, L2Regularize, NoRegularize, Nzl2Regularize, Nzsl, NzslL2, NzslNzl2, Regularize,
    Update,
};
use dmf_matrix::FactorizationData;

use crate::args::FunctorSpec;

fn arity_error(spec: &FunctorSpec, expected: usize) -> MfError {
    MfError::Config(format!(
        "{} expects {expected} argument(s), got {}",
        spec.name,
        spec.args.len()
    ))
}

/// Maps a parsed `--update` string to a concrete functor (spec §6: "the
/// parser maps Name to a functor and checks arity").
pub fn build_update(spec: &FunctorSpec) -> Result<Arc<dyn Update>> {
    match spec.name.as_str() {
        "Nzsl" | "Sl" => Ok(Arc::new(Nzsl)),
        "Gkl" => Ok(Arc::new(Gkl)),
        "Gnmf" => Ok(Arc::new(Gnmf)),
        "NzslL2" => {
            let [lambda] = *spec.args.as_slice() else { return Err(arity_error(spec, 1)) };
            Ok(Arc::new(NzslL2 { lambda }))
        }
        "NzslNzl2" => {
            let [lambda] = *spec.args.as_slice() else { return Err(arity_error(spec, 1)) };
            Ok(Arc::new(NzslNzl2 { lambda }))
        }
        "BiasedNzslNzl2" => {
            let [lambda_w, lambda_h, lambda_row, lambda_col] = *spec.args.as_slice() else {
                return Err(arity_error(spec, 4));
            };
            Ok(Arc::new(BiasedNzslNzl2 { lambda_w, lambda_h, lambda_row, lambda_col }))
        }
        other => Err(MfError::Config(format!("unknown update functor {other:?}"))),
    }
}

/// Maps a parsed `--regularize` string to a concrete functor. `Nzl2`'s
/// per-row/column weights are snapshotted from `data` at job construction.
pub fn build_regularize(spec: &FunctorSpec, data: &FactorizationData) -> Result<Arc<dyn Regularize>> {
    match spec.name.as_str() {
        "None" => Ok(Arc::new(NoRegularize)),
        "L2" => {
            let [lambda] = *spec.args.as_slice() else { return Err(arity_error(spec, 1)) };
            Ok(Arc::new(L2Regularize { lambda }))
        }
        "Nzl2" => {
            let [lambda] = *spec.args.as_slice() else { return Err(arity_error(spec, 1)) };
            Ok(Arc::new(Nzl2Regularize {
                lambda,
                nnz1: data.nnz1.clone(),
                nnz2: data.nnz2.clone(),
                rescale_per_stratum: true,
            }))
        }
        other => Err(MfError::Config(format!("unknown regularize functor {other:?}"))),
    }
}

/// Maps a parsed `--loss` string to a loss function (spec §4.13 step 4).
pub fn build_loss(spec: &FunctorSpec) -> Result<Box<dyn Fn(&FactorizationData) -> LossParts>> {
    match spec.name.as_str() {
        "Nzsl" | "Sl" => Ok(Box::new(loss::nzsl_loss)),
        "Gkl" => Ok(Box::new(loss::gkl_loss)),
        "NzslL2" => {
            let [lambda] = *spec.args.as_slice() else { return Err(arity_error(spec, 1)) };
            Ok(Box::new(move |data: &FactorizationData| loss::nzsl_l2_loss(data, lambda)))
        }
        "NzslNzl2" => {
            let [lambda] = *spec.args.as_slice() else { return Err(arity_error(spec, 1)) };
            Ok(Box::new(move |data: &FactorizationData| loss::nzsl_nzl2_loss(data, lambda)))
        }
        other => Err(MfError::Config(format!("unknown loss functor {other:?}"))),
    }
}

/// Maps a parsed `--decay` string to a decay controller. `Auto` needs a
/// per-epoch trial evaluator the CLI wires separately, so this returns the
/// non-`Auto` controllers behind `Decay`, and the caller special-cases
/// `Auto` to call `Auto::search` instead.
pub fn build_decay(spec: &FunctorSpec) -> Result<Box<dyn Decay>> {
    match spec.name.as_str() {
        "Constant" => {
            let [eps0] = *spec.args.as_slice() else { return Err(arity_error(spec, 1)) };
            Ok(Box::new(Constant { eps0 }))
        }
        "Sequential" => {
            let [eps0, alpha, decay_exponent] = *spec.args.as_slice() else { return Err(arity_error(spec, 3)) };
            Ok(Box::new(Sequential { eps0, alpha, decay_exponent }))
        }
        "BoldDriver" => {
            let [eps0, down, up] = *spec.args.as_slice() else { return Err(arity_error(spec, 3)) };
            Ok(Box::new(BoldDriver::new(eps0, down, up, false)))
        }
        other => Err(MfError::Config(format!(
            "unknown or unsupported decay functor {other:?} (Auto is wired separately)"
        ))),
    }
}

/// Builds an `Auto` decay controller from `Auto(eps0, tries, max_retries)`.
pub fn build_auto_decay(spec: &FunctorSpec) -> Result<Auto> {
    let [eps0, tries, max_retries] = *spec.args.as_slice() else { return Err(arity_error(spec, 3)) };
    Ok(Auto::new(eps0, tries as usize, max_retries as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::parse_functor;

    #[test]
    fn nzsl_l2_requires_exactly_one_argument() {
        let spec = parse_functor("NzslL2()").unwrap();
        assert!(build_update(&spec).is_err());
    }

    #[test]
    fn unknown_update_name_is_a_config_error() {
        let spec = parse_functor("NotARealFunctor(1.0)").unwrap();
        assert!(build_update(&spec).is_err());
    }

    #[test]
    fn constant_decay_builds_successfully() {
        let spec = parse_functor("Constant(0.05)").unwrap();
        assert!(build_decay(&spec).is_ok());
    }
}
