// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 the o2-rs contributors

//! Sequential argument extraction with on-request type coercion.
//!
//! [`Extractor::get_next`] walks a message's arguments in order. When
//! the requested type differs from the stored type, the value is
//! coerced if and only if no information is lost; otherwise `None` is
//! returned and the cursor stays put, so the caller can retry with the
//! actual type.

use super::cursor::ReadCursor;
use super::{ArgView, Message, TypeCode};

/// Cursor over one message's arguments.
#[derive(Debug)]
pub struct Extractor<'m> {
    msg: &'m Message,
    type_idx: usize,
    arg_off: usize,
}

impl<'m> Extractor<'m> {
    /// Start extraction at the first argument.
    #[must_use]
    pub fn new(msg: &'m Message) -> Self {
        Self {
            msg,
            type_idx: 0,
            arg_off: 0,
        }
    }

    /// Number of arguments in the message.
    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.msg.types().len()
    }

    /// Get the next argument as `want`, coercing when lossless.
    ///
    /// Returns `None` past the last argument, on a malformed argument,
    /// or when the conversion would lose information; in every `None`
    /// case the cursor does not advance.
    pub fn get_next(&mut self, want: TypeCode) -> Option<ArgView<'m>> {
        let (view, next_idx, next_off) = self.decode_current()?;
        let out = coerce(view, want)?;
        self.type_idx = next_idx;
        self.arg_off = next_off;
        Some(out)
    }

    /// Get the next argument in its stored type, no coercion.
    pub fn next_value(&mut self) -> Option<ArgView<'m>> {
        let (view, next_idx, next_off) = self.decode_current()?;
        self.type_idx = next_idx;
        self.arg_off = next_off;
        Some(view)
    }

    fn decode_current(&self) -> Option<(ArgView<'m>, usize, usize)> {
        let types = self.msg.types().as_bytes();
        let code = TypeCode::from_u8(*types.get(self.type_idx)?)?;
        let args = self.msg.args_bytes();
        let mut r = ReadCursor::new(&args[self.arg_off.min(args.len())..]);
        let view = match code {
            TypeCode::Int32 => ArgView::Int32(r.read_i32().ok()?),
            TypeCode::Int64 => ArgView::Int64(r.read_i64().ok()?),
            TypeCode::Float => ArgView::Float(r.read_f32().ok()?),
            TypeCode::Double => ArgView::Double(r.read_f64().ok()?),
            TypeCode::Time => ArgView::Time(r.read_f64().ok()?),
            TypeCode::String => ArgView::Str(r.read_padded_str().ok()?),
            TypeCode::Symbol => ArgView::Symbol(r.read_padded_str().ok()?),
            TypeCode::Char => ArgView::Char(char::from_u32(r.read_i32().ok()? as u32)?),
            TypeCode::Midi => {
                let b = r.read_bytes(4).ok()?;
                ArgView::Midi([b[0], b[1], b[2], b[3]])
            }
            TypeCode::Blob => {
                let size = r.read_u32().ok()? as usize;
                let b = r.read_bytes(size).ok()?;
                r.align4().ok()?;
                ArgView::Blob(b)
            }
            TypeCode::Bool => ArgView::Bool(r.read_i32().ok()? != 0),
            TypeCode::True => ArgView::True,
            TypeCode::False => ArgView::False,
            TypeCode::Nil => ArgView::Nil,
            TypeCode::Infinitum => ArgView::Infinitum,
        };
        Some((view, self.type_idx + 1, self.arg_off + r.offset()))
    }
}

/// Convert `arg` to type `want`, or `None` when the conversion would
/// lose information.
///
/// The matrix: identical types pass through; string and symbol
/// interchange freely; time and double interchange freely; numeric
/// conversions succeed exactly when the value survives a round trip;
/// `T`/`F`/`B` interconvert with the integers 0 and 1; char converts
/// through its code point. Everything else fails.
#[must_use]
pub fn coerce<'m>(arg: ArgView<'m>, want: TypeCode) -> Option<ArgView<'m>> {
    if arg.type_code() == want {
        return Some(arg);
    }
    match (arg, want) {
        // String <-> symbol is a relabeling.
        (ArgView::Str(s), TypeCode::Symbol) => Some(ArgView::Symbol(s)),
        (ArgView::Symbol(s), TypeCode::String) => Some(ArgView::Str(s)),

        // Time <-> double is a relabeling; either joins the numeric group.
        (ArgView::Time(v), TypeCode::Double) => Some(ArgView::Double(v)),
        (ArgView::Double(v), TypeCode::Time) => Some(ArgView::Time(v)),
        (ArgView::Time(v), _) => coerce(ArgView::Double(v), want),
        (ArgView::Float(v), TypeCode::Time) => coerce(ArgView::Float(v), TypeCode::Double)
            .and_then(|d| coerce(d, TypeCode::Time)),
        (ArgView::Int32(v), TypeCode::Time) => Some(ArgView::Time(f64::from(v))),
        (ArgView::Int64(v), TypeCode::Time) => {
            exact_i64_to_f64(v).map(ArgView::Time)
        }

        // Integer widths.
        (ArgView::Int32(v), TypeCode::Int64) => Some(ArgView::Int64(i64::from(v))),
        (ArgView::Int64(v), TypeCode::Int32) => {
            i32::try_from(v).ok().map(ArgView::Int32)
        }

        // Integer -> float, only when exactly representable.
        (ArgView::Int32(v), TypeCode::Float) => {
            let f = v as f32;
            (f as i64 == i64::from(v)).then_some(ArgView::Float(f))
        }
        (ArgView::Int32(v), TypeCode::Double) => Some(ArgView::Double(f64::from(v))),
        (ArgView::Int64(v), TypeCode::Float) => {
            let f = v as f32;
            (f.is_finite() && f as i128 == i128::from(v)).then_some(ArgView::Float(f))
        }
        (ArgView::Int64(v), TypeCode::Double) => exact_i64_to_f64(v).map(ArgView::Double),

        // Float -> integer, only for integral in-range values.
        (ArgView::Float(v), TypeCode::Int32) => exact_f32_i32_value(v).map(ArgView::Int32),
        (ArgView::Float(v), TypeCode::Int64) => exact_f64_to_i64(f64::from(v)).map(ArgView::Int64),
        (ArgView::Float(v), TypeCode::Double) => Some(ArgView::Double(f64::from(v))),
        (ArgView::Double(v), TypeCode::Int32) => exact_f64_to_i64(v)
            .and_then(|i| i32::try_from(i).ok())
            .map(ArgView::Int32),
        (ArgView::Double(v), TypeCode::Int64) => exact_f64_to_i64(v).map(ArgView::Int64),
        (ArgView::Double(v), TypeCode::Float) => {
            let f = v as f32;
            (f64::from(f) == v).then_some(ArgView::Float(f))
        }

        // Char through its code point.
        (ArgView::Char(c), TypeCode::Int32) => Some(ArgView::Int32(c as i32)),
        (ArgView::Char(c), TypeCode::Int64) => Some(ArgView::Int64(c as i64)),
        (ArgView::Int32(v), TypeCode::Char) => {
            u32::try_from(v).ok().and_then(char::from_u32).map(ArgView::Char)
        }
        (ArgView::Int64(v), TypeCode::Char) => {
            u32::try_from(v).ok().and_then(char::from_u32).map(ArgView::Char)
        }

        // Truth values interconvert with 0/1.
        (ArgView::True, TypeCode::Bool) => Some(ArgView::Bool(true)),
        (ArgView::False, TypeCode::Bool) => Some(ArgView::Bool(false)),
        (ArgView::True, TypeCode::Int32) => Some(ArgView::Int32(1)),
        (ArgView::False, TypeCode::Int32) => Some(ArgView::Int32(0)),
        (ArgView::True, TypeCode::Int64) => Some(ArgView::Int64(1)),
        (ArgView::False, TypeCode::Int64) => Some(ArgView::Int64(0)),
        (ArgView::Bool(b), TypeCode::True) => b.then_some(ArgView::True),
        (ArgView::Bool(b), TypeCode::False) => (!b).then_some(ArgView::False),
        (ArgView::Bool(b), TypeCode::Int32) => Some(ArgView::Int32(i32::from(b))),
        (ArgView::Bool(b), TypeCode::Int64) => Some(ArgView::Int64(i64::from(b))),
        (ArgView::Int32(0), TypeCode::Bool) => Some(ArgView::Bool(false)),
        (ArgView::Int32(1), TypeCode::Bool) => Some(ArgView::Bool(true)),
        (ArgView::Int64(0), TypeCode::Bool) => Some(ArgView::Bool(false)),
        (ArgView::Int64(1), TypeCode::Bool) => Some(ArgView::Bool(true)),
        (ArgView::Int32(1), TypeCode::True) | (ArgView::Int64(1), TypeCode::True) => {
            Some(ArgView::True)
        }
        (ArgView::Int32(0), TypeCode::False) | (ArgView::Int64(0), TypeCode::False) => {
            Some(ArgView::False)
        }

        _ => None,
    }
}

fn exact_i64_to_f64(v: i64) -> Option<f64> {
    let f = v as f64;
    (f as i128 == i128::from(v)).then_some(f)
}

fn exact_f64_to_i64(v: f64) -> Option<i64> {
    if v.fract() != 0.0 || !v.is_finite() {
        return None;
    }
    if v < i64::MIN as f64 || v >= i64::MAX as f64 {
        return None;
    }
    Some(v as i64)
}

fn exact_f32_i32_value(v: f32) -> Option<i32> {
    exact_f64_to_i64(f64::from(v)).and_then(|i| i32::try_from(i).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::codec::encode_message;

    #[test]
    fn test_exact_match_no_coercion() {
        let msg = encode_message(0.0, "/x", &[ArgView::Int32(42)]).expect("encode");
        let mut ex = msg.extract();
        assert_eq!(ex.get_next(TypeCode::Int32), Some(ArgView::Int32(42)));
        assert_eq!(ex.get_next(TypeCode::Int32), None);
    }

    #[test]
    fn test_failed_coercion_leaves_cursor() {
        let msg = encode_message(0.0, "/x", &[ArgView::Str("abc"), ArgView::Int32(7)])
            .expect("encode");
        let mut ex = msg.extract();
        // A string never becomes a number.
        assert_eq!(ex.get_next(TypeCode::Int32), None);
        // Cursor unchanged: the string is still next.
        assert_eq!(ex.get_next(TypeCode::String), Some(ArgView::Str("abc")));
        assert_eq!(ex.get_next(TypeCode::Int32), Some(ArgView::Int32(7)));
    }

    #[test]
    fn test_widening() {
        assert_eq!(
            coerce(ArgView::Int32(7), TypeCode::Int64),
            Some(ArgView::Int64(7))
        );
        assert_eq!(
            coerce(ArgView::Int32(7), TypeCode::Double),
            Some(ArgView::Double(7.0))
        );
        assert_eq!(
            coerce(ArgView::Float(1.5), TypeCode::Double),
            Some(ArgView::Double(1.5))
        );
        assert_eq!(
            coerce(ArgView::Time(2.0), TypeCode::Double),
            Some(ArgView::Double(2.0))
        );
    }

    #[test]
    fn test_narrowing_exact_only() {
        assert_eq!(
            coerce(ArgView::Double(3.0), TypeCode::Int32),
            Some(ArgView::Int32(3))
        );
        assert_eq!(coerce(ArgView::Double(3.5), TypeCode::Int32), None);
        assert_eq!(
            coerce(ArgView::Int64(1 << 20), TypeCode::Int32),
            Some(ArgView::Int32(1 << 20))
        );
        assert_eq!(coerce(ArgView::Int64(1 << 40), TypeCode::Int32), None);
        assert_eq!(
            coerce(ArgView::Double(0.5), TypeCode::Float),
            Some(ArgView::Float(0.5))
        );
        assert_eq!(coerce(ArgView::Double(0.1), TypeCode::Float), None);
        // 2^24 + 1 is not representable in f32.
        assert_eq!(coerce(ArgView::Int32(16_777_217), TypeCode::Float), None);
        assert_eq!(
            coerce(ArgView::Int32(16_777_216), TypeCode::Float),
            Some(ArgView::Float(16_777_216.0))
        );
    }

    #[test]
    fn test_truth_values() {
        assert_eq!(coerce(ArgView::True, TypeCode::Int32), Some(ArgView::Int32(1)));
        assert_eq!(coerce(ArgView::False, TypeCode::Int64), Some(ArgView::Int64(0)));
        assert_eq!(coerce(ArgView::Int32(1), TypeCode::Bool), Some(ArgView::Bool(true)));
        assert_eq!(coerce(ArgView::Int32(2), TypeCode::Bool), None);
        assert_eq!(coerce(ArgView::Bool(true), TypeCode::True), Some(ArgView::True));
        assert_eq!(coerce(ArgView::Bool(true), TypeCode::False), None);
    }

    #[test]
    fn test_string_symbol() {
        assert_eq!(
            coerce(ArgView::Str("a"), TypeCode::Symbol),
            Some(ArgView::Symbol("a"))
        );
        assert_eq!(
            coerce(ArgView::Symbol("a"), TypeCode::String),
            Some(ArgView::Str("a"))
        );
        assert_eq!(coerce(ArgView::Str("123"), TypeCode::Int32), None);
    }

    #[test]
    fn test_no_wrong_typed_result() {
        // Totality sweep: every (stored, requested) pair either fails or
        // yields exactly the requested type.
        let blob = [1u8, 2];
        let stored = [
            ArgView::Int32(1),
            ArgView::Int64(1),
            ArgView::Float(1.0),
            ArgView::Double(1.0),
            ArgView::Time(1.0),
            ArgView::Str("s"),
            ArgView::Symbol("S"),
            ArgView::Char('c'),
            ArgView::Midi([0, 1, 2, 3]),
            ArgView::Blob(&blob),
            ArgView::Bool(true),
            ArgView::True,
            ArgView::False,
            ArgView::Nil,
            ArgView::Infinitum,
        ];
        let wanted = [
            TypeCode::Int32,
            TypeCode::Int64,
            TypeCode::Float,
            TypeCode::Double,
            TypeCode::Time,
            TypeCode::String,
            TypeCode::Symbol,
            TypeCode::Char,
            TypeCode::Midi,
            TypeCode::Blob,
            TypeCode::Bool,
            TypeCode::True,
            TypeCode::False,
            TypeCode::Nil,
            TypeCode::Infinitum,
        ];
        for arg in &stored {
            for want in wanted {
                if let Some(out) = coerce(*arg, want) {
                    assert_eq!(out.type_code(), want, "{:?} -> {:?}", arg, want);
                }
            }
        }
    }
}
