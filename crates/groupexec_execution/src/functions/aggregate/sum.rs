use groupexec_error::{GroupExecError, Result};
use groupexec_row::datatype::DataType;
use groupexec_row::datum::Datum;

use super::{
    decode_state, encode_state, AggFnContext, AggregateMeta, FinalFn, FinalModify, StateCodecFn,
    TransFn,
};
use crate::expr::aggregate_expr::AggregateId;

pub const SUM_INT64: AggregateId = AggregateId(3);
pub const SUM_FLOAT64: AggregateId = AggregateId(4);

pub fn entries() -> Vec<AggregateMeta> {
    vec![
        AggregateMeta {
            id: SUM_INT64,
            name: "sum",
            arg_types: vec![DataType::Int64],
            result_type: DataType::Int64,
            trans_type: DataType::Int64,
            internal_state: false,
            // Null initial value plus a strict transition function: the first
            // non-null input is adopted as the state without a call, which is
            // also what makes sum over all-null input return null.
            init_value: None,
            trans_fn: TransFn {
                name: "int8pl",
                strict: true,
                func: int8_add,
            },
            final_fn: None,
            num_final_extra_args: 0,
            combine_fn: Some(TransFn {
                name: "int8pl",
                strict: true,
                func: int8_add,
            }),
            serial_fn: None,
            deserial_fn: None,
            final_modify: FinalModify::ReadOnly,
            trans_space: 0,
        },
        AggregateMeta {
            id: SUM_FLOAT64,
            name: "sum",
            arg_types: vec![DataType::Float64],
            result_type: DataType::Float64,
            // Shares the (sum, count) accumulator with avg(float8); only the
            // final function differs. The dedup pass relies on the identical
            // transition-side rows to share one state.
            trans_type: float_accum_type(),
            internal_state: true,
            init_value: Some("{0,0}"),
            trans_fn: FLOAT8_ACCUM,
            final_fn: Some(FinalFn {
                name: "float8_sum_final",
                strict: false,
                func: float8_sum_final,
            }),
            num_final_extra_args: 0,
            combine_fn: Some(FLOAT8_ACCUM_COMBINE),
            serial_fn: Some(FLOAT8_ACCUM_SERIALIZE),
            deserial_fn: Some(FLOAT8_ACCUM_DESERIALIZE),
            final_modify: FinalModify::ReadOnly,
            trans_space: 0,
        },
    ]
}

pub fn float_accum_type() -> DataType {
    DataType::Struct(vec![DataType::Float64, DataType::Int64])
}

pub const FLOAT8_ACCUM: TransFn = TransFn {
    name: "float8_accum",
    strict: true,
    func: float8_accum,
};

pub const FLOAT8_ACCUM_COMBINE: TransFn = TransFn {
    name: "float8_accum_combine",
    strict: false,
    func: float8_accum_combine,
};

pub const FLOAT8_ACCUM_SERIALIZE: StateCodecFn = StateCodecFn {
    name: "float8_accum_serialize",
    strict: true,
    func: encode_state,
};

pub const FLOAT8_ACCUM_DESERIALIZE: StateCodecFn = StateCodecFn {
    name: "float8_accum_deserialize",
    strict: true,
    func: decode_state,
};

fn unpack_accum(state: &Option<Datum>) -> Result<(f64, i64)> {
    match state {
        Some(Datum::Struct(fields)) if fields.len() == 2 => {
            let sum = match &fields[0] {
                Some(d) => d.try_as_f64()?,
                None => 0.0,
            };
            let count = match &fields[1] {
                Some(d) => d.try_as_i64()?,
                None => 0,
            };
            Ok((sum, count))
        }
        other => Err(GroupExecError::new(format!(
            "Malformed float accumulator state: {other:?}"
        ))),
    }
}

fn pack_accum(sum: f64, count: i64) -> Option<Datum> {
    Some(Datum::Struct(vec![
        Some(Datum::Float64(sum)),
        Some(Datum::Int64(count)),
    ]))
}

fn required_i64(value: &Option<Datum>) -> Result<i64> {
    match value {
        Some(d) => d.try_as_i64(),
        None => Err(GroupExecError::new("Unexpected null in strict function")),
    }
}

fn int8_add(
    _ctx: &mut AggFnContext,
    state: Option<Datum>,
    args: &[Option<Datum>],
) -> Result<Option<Datum>> {
    // Strict, so both the state and the argument are non-null here.
    let state = required_i64(&state)?;
    let arg = required_i64(&args[0])?;
    Ok(Some(Datum::Int64(state.wrapping_add(arg))))
}

fn float8_accum(
    _ctx: &mut AggFnContext,
    state: Option<Datum>,
    args: &[Option<Datum>],
) -> Result<Option<Datum>> {
    let (sum, count) = unpack_accum(&state)?;
    let value = match &args[0] {
        Some(d) => d.try_as_f64()?,
        None => return Err(GroupExecError::new("Unexpected null in strict function")),
    };
    Ok(pack_accum(sum + value, count + 1))
}

fn float8_accum_combine(
    _ctx: &mut AggFnContext,
    state: Option<Datum>,
    args: &[Option<Datum>],
) -> Result<Option<Datum>> {
    match (&state, &args[0]) {
        (_, None) => Ok(state),
        (None, Some(other)) => Ok(Some(other.clone())),
        (Some(_), Some(_)) => {
            let (sum, count) = unpack_accum(&state)?;
            let (other_sum, other_count) = unpack_accum(&args[0])?;
            Ok(pack_accum(sum + other_sum, count + other_count))
        }
    }
}

fn float8_sum_final(
    _ctx: &mut AggFnContext,
    state: &Option<Datum>,
    _extra: &[Option<Datum>],
) -> Result<Option<Datum>> {
    match state {
        None => Ok(None),
        Some(_) => {
            let (sum, count) = unpack_accum(state)?;
            if count == 0 {
                Ok(None)
            } else {
                Ok(Some(Datum::Float64(sum)))
            }
        }
    }
}
