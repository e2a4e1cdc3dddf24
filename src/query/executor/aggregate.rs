//! Aggregate accumulators
//!
//! Nulls are skipped by every aggregate except `count(*)`. Empty groups give
//! 0 for `count` and `sum`, an empty list for `collect`, 0 for `stdev` and
//! null for the rest.

use super::record::Value;
use super::{ExecutionError, ExecutionResult};
use crate::query::ir::{AggregateCall, AggregateFunction};
use rustc_hash::FxHashSet;
use std::cmp::Ordering;

#[derive(Debug, Clone)]
enum State {
    Count(i64),
    Sum { int: i64, float: f64, is_float: bool },
    Avg { sum: f64, count: u64 },
    Extreme(Option<Value>),
    Collect(Vec<Value>),
    // Welford's running mean and squared distance
    StDev { count: u64, mean: f64, m2: f64 },
}

#[derive(Debug, Clone)]
pub struct Accumulator {
    function: AggregateFunction,
    count_rows: bool,
    seen: Option<FxHashSet<Value>>,
    state: State,
}

impl Accumulator {
    pub fn new(call: &AggregateCall) -> Self {
        let state = match call.function {
            AggregateFunction::Count => State::Count(0),
            AggregateFunction::Sum => State::Sum {
                int: 0,
                float: 0.0,
                is_float: false,
            },
            AggregateFunction::Avg => State::Avg { sum: 0.0, count: 0 },
            AggregateFunction::Min | AggregateFunction::Max => State::Extreme(None),
            AggregateFunction::Collect => State::Collect(Vec::new()),
            AggregateFunction::StDev => State::StDev {
                count: 0,
                mean: 0.0,
                m2: 0.0,
            },
        };
        Accumulator {
            function: call.function,
            count_rows: call.arg.is_none(),
            seen: call.distinct.then(FxHashSet::default),
            state,
        }
    }

    /// Feed one row's argument value; `count(*)` ignores it
    pub fn update(&mut self, value: Value) -> ExecutionResult<()> {
        if self.count_rows {
            if let State::Count(n) = &mut self.state {
                *n += 1;
            }
            return Ok(());
        }
        if value.is_null() {
            return Ok(());
        }
        if let Some(seen) = &mut self.seen {
            if !seen.insert(value.clone()) {
                return Ok(());
            }
        }
        let numeric = |v: &Value| {
            v.as_float().ok_or_else(|| {
                ExecutionError::TypeError(format!("{:?}() expects numbers, got {}", self.function, v.type_name()))
            })
        };
        match &mut self.state {
            State::Count(n) => *n += 1,
            State::Sum { int, float, is_float } => match value {
                Value::Integer(i) if !*is_float => match int.checked_add(i) {
                    Some(total) => *int = total,
                    None => {
                        *is_float = true;
                        *float = *int as f64 + i as f64;
                    }
                },
                Value::Integer(i) => *float += i as f64,
                Value::Float(f) => {
                    if !*is_float {
                        *is_float = true;
                        *float = *int as f64;
                    }
                    *float += f;
                }
                other => {
                    return Err(ExecutionError::TypeError(format!(
                        "sum() expects numbers, got {}",
                        other.type_name()
                    )))
                }
            },
            State::Avg { sum, count } => {
                *sum += numeric(&value)?;
                *count += 1;
            }
            State::Extreme(current) => {
                let wanted = if self.function == AggregateFunction::Min {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                let replace = match current {
                    None => true,
                    Some(c) => value.order_cmp(c) == wanted,
                };
                if replace {
                    *current = Some(value);
                }
            }
            State::Collect(items) => items.push(value),
            State::StDev { count, mean, m2 } => {
                let x = numeric(&value)?;
                *count += 1;
                let delta = x - *mean;
                *mean += delta / *count as f64;
                *m2 += delta * (x - *mean);
            }
        }
        Ok(())
    }

    pub fn finish(self) -> Value {
        match self.state {
            State::Count(n) => Value::Integer(n),
            State::Sum { int, float, is_float } => {
                if is_float {
                    Value::Float(float)
                } else {
                    Value::Integer(int)
                }
            }
            State::Avg { count: 0, .. } => Value::Null,
            State::Avg { sum, count } => Value::Float(sum / count as f64),
            State::Extreme(v) => v.unwrap_or(Value::Null),
            State::Collect(items) => Value::List(items),
            State::StDev { count, m2, .. } => {
                if count < 2 {
                    Value::Float(0.0)
                } else {
                    Value::Float((m2 / (count - 1) as f64).sqrt())
                }
            }
        }
    }
}
