use groupexec_error::{GroupExecError, Result};
use groupexec_row::datatype::DataType;
use groupexec_row::datum::Datum;

use super::sum::{
    float_accum_type, FLOAT8_ACCUM, FLOAT8_ACCUM_COMBINE, FLOAT8_ACCUM_DESERIALIZE,
    FLOAT8_ACCUM_SERIALIZE,
};
use super::{
    decode_state, encode_state, AggFnContext, AggregateMeta, FinalFn, FinalModify, StateCodecFn,
    TransFn,
};
use crate::expr::aggregate_expr::AggregateId;

pub const AVG_INT64: AggregateId = AggregateId(5);
pub const AVG_FLOAT64: AggregateId = AggregateId(6);

pub fn entries() -> Vec<AggregateMeta> {
    vec![
        AggregateMeta {
            id: AVG_INT64,
            name: "avg",
            arg_types: vec![DataType::Int64],
            result_type: DataType::Float64,
            trans_type: DataType::Struct(vec![DataType::Int64, DataType::Int64]),
            internal_state: true,
            init_value: Some("{0,0}"),
            trans_fn: TransFn {
                name: "int8_avg_accum",
                strict: true,
                func: int8_avg_accum,
            },
            final_fn: Some(FinalFn {
                name: "int8_avg_final",
                strict: false,
                func: int8_avg_final,
            }),
            num_final_extra_args: 0,
            combine_fn: Some(TransFn {
                name: "int8_avg_combine",
                strict: false,
                func: int8_avg_combine,
            }),
            serial_fn: Some(StateCodecFn {
                name: "int8_avg_serialize",
                strict: true,
                func: encode_state,
            }),
            deserial_fn: Some(StateCodecFn {
                name: "int8_avg_deserialize",
                strict: true,
                func: decode_state,
            }),
            final_modify: FinalModify::ReadOnly,
            trans_space: 0,
        },
        // avg(float8) runs the same accumulator as sum(float8); it differs
        // only in the final projection.
        AggregateMeta {
            id: AVG_FLOAT64,
            name: "avg",
            arg_types: vec![DataType::Float64],
            result_type: DataType::Float64,
            trans_type: float_accum_type(),
            internal_state: true,
            init_value: Some("{0,0}"),
            trans_fn: FLOAT8_ACCUM,
            final_fn: Some(FinalFn {
                name: "float8_avg_final",
                strict: false,
                func: float8_avg_final,
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

fn unpack_int_accum(state: &Option<Datum>) -> Result<(i64, i64)> {
    match state {
        Some(Datum::Struct(fields)) if fields.len() == 2 => {
            let sum = match &fields[0] {
                Some(d) => d.try_as_i64()?,
                None => 0,
            };
            let count = match &fields[1] {
                Some(d) => d.try_as_i64()?,
                None => 0,
            };
            Ok((sum, count))
        }
        other => Err(GroupExecError::new(format!(
            "Malformed integer accumulator state: {other:?}"
        ))),
    }
}

fn pack_int_accum(sum: i64, count: i64) -> Option<Datum> {
    Some(Datum::Struct(vec![
        Some(Datum::Int64(sum)),
        Some(Datum::Int64(count)),
    ]))
}

fn int8_avg_accum(
    _ctx: &mut AggFnContext,
    state: Option<Datum>,
    args: &[Option<Datum>],
) -> Result<Option<Datum>> {
    let (sum, count) = unpack_int_accum(&state)?;
    let value = match &args[0] {
        Some(d) => d.try_as_i64()?,
        None => return Err(GroupExecError::new("Unexpected null in strict function")),
    };
    Ok(pack_int_accum(sum.wrapping_add(value), count + 1))
}

fn int8_avg_combine(
    _ctx: &mut AggFnContext,
    state: Option<Datum>,
    args: &[Option<Datum>],
) -> Result<Option<Datum>> {
    match (&state, &args[0]) {
        (_, None) => Ok(state),
        (None, Some(other)) => Ok(Some(other.clone())),
        (Some(_), Some(_)) => {
            let (sum, count) = unpack_int_accum(&state)?;
            let (other_sum, other_count) = unpack_int_accum(&args[0])?;
            Ok(pack_int_accum(sum.wrapping_add(other_sum), count + other_count))
        }
    }
}

fn int8_avg_final(
    _ctx: &mut AggFnContext,
    state: &Option<Datum>,
    _extra: &[Option<Datum>],
) -> Result<Option<Datum>> {
    match state {
        None => Ok(None),
        Some(_) => {
            let (sum, count) = unpack_int_accum(state)?;
            if count == 0 {
                Ok(None)
            } else {
                Ok(Some(Datum::Float64(sum as f64 / count as f64)))
            }
        }
    }
}

fn float8_avg_final(
    _ctx: &mut AggFnContext,
    state: &Option<Datum>,
    _extra: &[Option<Datum>],
) -> Result<Option<Datum>> {
    match state {
        None => Ok(None),
        Some(Datum::Struct(fields)) if fields.len() == 2 => {
            let sum = match &fields[0] {
                Some(d) => d.try_as_f64()?,
                None => 0.0,
            };
            let count = match &fields[1] {
                Some(d) => d.try_as_i64()?,
                None => 0,
            };
            if count == 0 {
                Ok(None)
            } else {
                Ok(Some(Datum::Float64(sum / count as f64)))
            }
        }
        other => Err(GroupExecError::new(format!(
            "Malformed float accumulator state: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avg_accumulates_and_projects() {
        let mut ctx = AggFnContext::outside_aggregate();
        let state = pack_int_accum(0, 0);
        let state = int8_avg_accum(&mut ctx, state, &[Some(Datum::Int64(4))]).unwrap();
        let state = int8_avg_accum(&mut ctx, state, &[Some(Datum::Int64(8))]).unwrap();

        let out = int8_avg_final(&mut ctx, &state, &[]).unwrap();
        assert_eq!(Some(Datum::Float64(6.0)), out);
    }

    #[test]
    fn avg_of_zero_rows_is_null() {
        let mut ctx = AggFnContext::outside_aggregate();
        let out = int8_avg_final(&mut ctx, &pack_int_accum(0, 0), &[]).unwrap();
        assert_eq!(None, out);
    }
}
