// Condition evaluator for rule gates

//! # Condition Evaluator
//!
//! Evaluates a condition tree to a boolean. Logical conditions compare their
//! operands; composition conditions load their children from storage and
//! combine them. Every evaluation produces a [`ConditionEvaluation`] report
//! listing the children that were actually evaluated, so short-circuiting is
//! visible to callers and tests.
//!
//! ## Operand Resolution
//!
//! For each operand, in order:
//! 1. the evaluation `argument` (first operand only), e.g. a question answer
//! 2. the literal `value`
//! 3. `source == Almanac`: the fact named by `key` (or `name`); Boolean
//!    operands are coerced with truthiness
//! 4. `source == Event`: the triggering event's context
//!
//! The raw value is then parsed into a [`TypedValue`] according to the
//! operand's declared data type. Only authored literals must parse; runtime
//! input (argument, almanac fact, event field) that does not fit the declared
//! type resolves to null, so the leaf fails and the explanation says why.
//!
//! ## Rust Learning Notes:
//!
//! ### Recursive Async Functions
//! An `async fn` cannot call itself directly because its future would have
//! infinite size. `evaluate_detailed` returns a `BoxFuture` built with
//! `FutureExt::boxed`, which puts each level of recursion on the heap.

use std::cmp::Ordering;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::engine::almanac::Almanac;
use crate::engine::storage::WorkflowStorage;
use crate::models::condition::{loose_json_eq, parse_datetime};
use crate::models::{
    CompositionOperator, Condition, DataType, Event, LogicalOperator, Operand, OperatorType,
    TypedValue, ValueSource,
};
use crate::{FlowgateError, Result};

/// Outcome of evaluating one condition, including evaluated children
#[derive(Debug, Clone, Serialize)]
pub struct ConditionEvaluation {
    pub condition_id: Uuid,
    pub passed: bool,
    pub explanation: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ConditionEvaluation>,
}

impl ConditionEvaluation {
    fn leaf(condition: &Condition, passed: bool, explanation: String) -> Self {
        Self {
            condition_id: condition.id,
            passed,
            explanation,
            children: Vec::new(),
        }
    }
}

/// Operand after source resolution and parsing
#[derive(Debug, Clone)]
struct Resolved {
    data_type: Option<DataType>,
    raw: Value,
    typed: TypedValue,
    /// The source had a value before any coercion
    present: bool,
    rejected: Option<String>,
}

impl Resolved {
    fn missing() -> Self {
        Self {
            data_type: None,
            raw: Value::Null,
            typed: TypedValue::Null,
            present: false,
            rejected: None,
        }
    }

    fn is_null(&self) -> bool {
        self.typed.is_null()
    }
}

#[derive(Clone)]
pub struct ConditionEvaluator {
    storage: Arc<dyn WorkflowStorage>,
}

impl ConditionEvaluator {
    pub fn new(storage: Arc<dyn WorkflowStorage>) -> Self {
        Self { storage }
    }

    pub async fn evaluate(
        &self,
        condition: &Condition,
        almanac: &Almanac,
        event: Option<&Event>,
        argument: Option<&Value>,
    ) -> Result<bool> {
        Ok(self
            .evaluate_detailed(condition, almanac, event, argument)
            .await?
            .passed)
    }

    /// Load a condition by id and evaluate it
    pub async fn evaluate_by_id(
        &self,
        condition_id: &Uuid,
        almanac: &Almanac,
        event: Option<&Event>,
        argument: Option<&Value>,
    ) -> Result<ConditionEvaluation> {
        let condition = self
            .storage
            .get_condition(condition_id)
            .await?
            .ok_or_else(|| FlowgateError::not_found("Condition", condition_id))?;
        self.evaluate_detailed(&condition, almanac, event, argument).await
    }

    pub fn evaluate_detailed<'a>(
        &'a self,
        condition: &'a Condition,
        almanac: &'a Almanac,
        event: Option<&'a Event>,
        argument: Option<&'a Value>,
    ) -> BoxFuture<'a, Result<ConditionEvaluation>> {
        async move {
            let evaluation = match condition.operator_type {
                OperatorType::Logical => self.evaluate_logical(condition, almanac, event, argument).await?,
                OperatorType::Composition => {
                    self.evaluate_composition(condition, almanac, event, argument).await?
                }
                other => {
                    return Err(FlowgateError::UnsupportedOperation(format!(
                        "operator type {:?} on condition {}",
                        other, condition.id
                    )))
                }
            };
            trace!(
                condition_id = %condition.id,
                passed = evaluation.passed,
                explanation = %evaluation.explanation,
                "Condition evaluated"
            );
            Ok(evaluation)
        }
        .boxed()
    }

    async fn evaluate_composition(
        &self,
        condition: &Condition,
        almanac: &Almanac,
        event: Option<&Event>,
        argument: Option<&Value>,
    ) -> Result<ConditionEvaluation> {
        let operator = condition.composition_operator;
        if operator == CompositionOperator::None {
            return Ok(ConditionEvaluation::leaf(
                condition,
                false,
                "Composition operator None never passes".to_string(),
            ));
        }

        let children = self.storage.list_condition_children(&condition.id).await?;
        if children.is_empty() {
            return Ok(ConditionEvaluation::leaf(
                condition,
                false,
                format!("{:?}: no child conditions", operator),
            ));
        }

        let mut reports = Vec::with_capacity(children.len());
        for child in &children {
            let report = self.evaluate_detailed(child, almanac, event, argument).await?;
            let passed = report.passed;
            reports.push(report);
            match operator {
                CompositionOperator::And if !passed => break,
                CompositionOperator::Or if passed => break,
                _ => {}
            }
        }

        let true_count = reports.iter().filter(|r| r.passed).count();
        let passed = match operator {
            CompositionOperator::And => reports.len() == children.len() && true_count == reports.len(),
            CompositionOperator::Or => true_count > 0,
            CompositionOperator::Xor => true_count == 1,
            CompositionOperator::None => false,
        };

        Ok(ConditionEvaluation {
            condition_id: condition.id,
            passed,
            explanation: format!(
                "{}: {} of {} evaluated children passed ({} total)",
                format!("{:?}", operator).to_uppercase(),
                true_count,
                reports.len(),
                children.len()
            ),
            children: reports,
        })
    }

    async fn evaluate_logical(
        &self,
        condition: &Condition,
        almanac: &Almanac,
        event: Option<&Event>,
        argument: Option<&Value>,
    ) -> Result<ConditionEvaluation> {
        let first = self
            .resolve(condition.first_operand.as_ref(), argument, almanac, event)
            .await?;
        let second = self
            .resolve(condition.second_operand.as_ref(), None, almanac, event)
            .await?;
        let third = self
            .resolve(condition.third_operand.as_ref(), None, almanac, event)
            .await?;

        let passed = apply_logical(&condition.logical_operator, &first, &second, &third)?;
        let mut explanation = format!(
            "{} {:?} {} => {}",
            first.raw,
            condition.logical_operator,
            second.raw,
            passed
        );
        for rejected in [&first, &second, &third].iter().filter_map(|r| r.rejected.as_ref()) {
            explanation.push_str(&format!(" ({})", rejected));
        }
        Ok(ConditionEvaluation::leaf(condition, passed, explanation))
    }

    async fn resolve(
        &self,
        operand: Option<&Operand>,
        argument: Option<&Value>,
        almanac: &Almanac,
        event: Option<&Event>,
    ) -> Result<Resolved> {
        let Some(operand) = operand else {
            return Ok(Resolved::missing());
        };

        let (raw, present, authored) = if let Some(argument) = argument {
            (argument.clone(), !argument.is_null(), false)
        } else if !operand.has_empty_value() {
            (operand.value.clone().unwrap_or(Value::Null), true, true)
        } else {
            match (operand.source, operand.lookup_key()) {
                (ValueSource::Almanac, Some(key)) => {
                    let fact = almanac.get_fact(key).await?.unwrap_or(Value::Null);
                    let present = !fact.is_null();
                    if operand.data_type == DataType::Boolean {
                        (Value::Bool(json_truthy(&fact)), present, false)
                    } else {
                        (fact, present, false)
                    }
                }
                (ValueSource::Event, Some(key)) => {
                    let value = event
                        .and_then(|event| event.context_value(key))
                        .unwrap_or(Value::Null);
                    let present = !value.is_null();
                    (value, present, false)
                }
                _ => (Value::Null, false, false),
            }
        };

        let (typed, rejected) = match TypedValue::parse(operand.data_type, &raw) {
            Ok(typed) => (typed, None),
            Err(e) if authored => return Err(e.into()),
            Err(e) => {
                debug!(operand = operand.lookup_key().unwrap_or("?"), error = %e, "Runtime input does not fit operand type");
                (TypedValue::Null, Some(format!("input {} treated as no match: {}", raw, e)))
            }
        };
        Ok(Resolved {
            data_type: Some(operand.data_type),
            raw,
            typed,
            present,
            rejected,
        })
    }
}

fn json_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn apply_logical(
    operator: &LogicalOperator,
    first: &Resolved,
    second: &Resolved,
    third: &Resolved,
) -> Result<bool> {
    let ordered = |accept: fn(Ordering) -> bool| {
        if first.is_null() || second.is_null() {
            return false;
        }
        first.typed.compare(&second.typed).map(accept).unwrap_or(false)
    };

    let passed = match operator {
        LogicalOperator::Equal => typed_equal(first, second),
        // untyped on purpose: compares the raw resolved values
        LogicalOperator::NotEqual => first.raw != second.raw,
        LogicalOperator::GreaterThan => ordered(|o| o == Ordering::Greater),
        LogicalOperator::GreaterThanOrEqual => ordered(|o| o != Ordering::Less),
        LogicalOperator::LessThan => ordered(|o| o == Ordering::Less),
        LogicalOperator::LessThanOrEqual => ordered(|o| o != Ordering::Greater),
        LogicalOperator::Between => {
            if first.is_null() || second.is_null() || third.is_null() {
                false
            } else {
                let lower = first.typed.compare(&second.typed);
                let upper = first.typed.compare(&third.typed);
                matches!(lower, Some(Ordering::Greater | Ordering::Equal))
                    && matches!(upper, Some(Ordering::Less | Ordering::Equal))
            }
        }
        LogicalOperator::In => match &second.typed {
            TypedValue::Array(items) if !first.is_null() => {
                items.iter().any(|item| loose_json_eq(&first.raw, item))
            }
            _ => false,
        },
        LogicalOperator::IsTrue => first.typed == TypedValue::Boolean(true),
        LogicalOperator::IsFalse => first.typed == TypedValue::Boolean(false),
        LogicalOperator::Contains => contains(first, second).unwrap_or(false),
        LogicalOperator::DoesNotContain => contains(first, second).map(|found| !found).unwrap_or(false),
        LogicalOperator::Exists => first.present,
        LogicalOperator::HasConsecutiveOccurrences => has_consecutive(first, second, third),
        LogicalOperator::RangesOverlap => ranges_overlap(&first.raw, &second.raw),
        LogicalOperator::None => false,
        LogicalOperator::Unsupported(name) => {
            return Err(FlowgateError::UnsupportedOperation(format!(
                "logical operator '{}'",
                name
            )))
        }
    };
    Ok(passed)
}

/// Equal: same declared type; text case-insensitive, arrays element-wise
fn typed_equal(first: &Resolved, second: &Resolved) -> bool {
    if first.data_type != second.data_type || first.is_null() || second.is_null() {
        return false;
    }
    match (&first.typed, &second.typed) {
        (TypedValue::Text(a), TypedValue::Text(b)) => a.to_lowercase() == b.to_lowercase(),
        (TypedValue::Array(a), TypedValue::Array(b)) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y),
        (a, b) => a == b,
    }
}

/// `None` when the first operand is neither text nor an array
fn contains(first: &Resolved, second: &Resolved) -> Option<bool> {
    match &first.typed {
        TypedValue::Text(haystack) => {
            let needle = match &second.typed {
                TypedValue::Text(s) => s.clone(),
                TypedValue::Null => return Some(false),
                other => other.to_json().to_string(),
            };
            Some(haystack.to_lowercase().contains(&needle.to_lowercase()))
        }
        TypedValue::Array(items) => Some(items.iter().any(|item| loose_json_eq(item, &second.raw))),
        _ => None,
    }
}

/// A run of at least `third` (default 2) consecutive elements equal to `second`
fn has_consecutive(first: &Resolved, second: &Resolved, third: &Resolved) -> bool {
    let TypedValue::Array(items) = &first.typed else {
        return false;
    };
    if second.raw.is_null() {
        return false;
    }
    let required = match &third.typed {
        TypedValue::Integer(n) if *n > 0 => *n as usize,
        TypedValue::Float(f) if *f >= 1.0 => *f as usize,
        _ => 2,
    };

    let mut run = 0usize;
    for item in items {
        if loose_json_eq(item, &second.raw) {
            run += 1;
            if run >= required {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

/// Inclusive overlap of two `[start, end]` ranges of numbers or dates
fn ranges_overlap(first: &Value, second: &Value) -> bool {
    match (range_bounds(first), range_bounds(second)) {
        (Some((a_start, a_end)), Some((b_start, b_end))) => a_start <= b_end && b_start <= a_end,
        _ => false,
    }
}

fn range_bounds(value: &Value) -> Option<(f64, f64)> {
    let parsed = match value {
        Value::String(s) => serde_json::from_str::<Value>(s).ok()?,
        other => other.clone(),
    };
    let items = parsed.as_array()?;
    if items.len() != 2 {
        return None;
    }
    let start = range_point(&items[0])?;
    let end = range_point(&items[1])?;
    Some(if start <= end { (start, end) } else { (end, start) })
}

fn range_point(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .or_else(|| parse_datetime(s).map(|dt| dt.timestamp_millis() as f64)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStorage;
    use crate::models::{Schema, SchemaInstance};
    use serde_json::json;

    struct Fixture {
        storage: Arc<dyn WorkflowStorage>,
        evaluator: ConditionEvaluator,
        almanac: Almanac,
    }

    async fn fixture() -> Fixture {
        let storage: Arc<dyn WorkflowStorage> = Arc::new(InMemoryStorage::new());
        let schema = storage.create_schema(Schema::new("tenant", "conditions")).await.unwrap();
        let instance = storage
            .create_schema_instance(SchemaInstance::new(&schema, "E-240101-001".into(), vec![]))
            .await
            .unwrap();
        Fixture {
            evaluator: ConditionEvaluator::new(storage.clone()),
            almanac: Almanac::new(storage.clone(), instance.id),
            storage,
        }
    }

    fn lit(data_type: DataType, value: Value) -> Operand {
        Operand::literal(data_type, value)
    }

    async fn check(f: &Fixture, condition: Condition) -> bool {
        f.evaluator.evaluate(&condition, &f.almanac, None, None).await.unwrap()
    }

    async fn binary(f: &Fixture, op: LogicalOperator, data_type: DataType, a: Value, b: Value) -> bool {
        check(f, Condition::logical(op, lit(data_type, a), Some(lit(data_type, b)))).await
    }

    #[tokio::test]
    async fn test_equal_truth_table() {
        let f = fixture().await;
        use DataType::*;
        use LogicalOperator::Equal;

        assert!(binary(&f, Equal, Integer, json!(3), json!(3)).await);
        assert!(!binary(&f, Equal, Integer, json!(3), json!(4)).await);
        assert!(binary(&f, Equal, Float, json!(2.5), json!("2.5")).await);
        assert!(!binary(&f, Equal, Float, json!(2.5), json!(2.25)).await);
        assert!(binary(&f, Equal, Boolean, json!(true), json!(true)).await);
        assert!(!binary(&f, Equal, Boolean, json!(true), json!(false)).await);
        assert!(binary(&f, Equal, Text, json!("Yes"), json!("yes")).await);
        assert!(!binary(&f, Equal, Text, json!("Yes"), json!("No")).await);
        assert!(binary(&f, Equal, Array, json!([1, 2]), json!([1, 2])).await);
        assert!(!binary(&f, Equal, Array, json!([1, 2]), json!([2, 1])).await);
    }

    #[tokio::test]
    async fn test_equal_requires_matching_types() {
        let f = fixture().await;
        let condition = Condition::logical(
            LogicalOperator::Equal,
            lit(DataType::Integer, json!(1)),
            Some(lit(DataType::Text, json!("1"))),
        );
        assert!(!check(&f, condition).await);
    }

    #[tokio::test]
    async fn test_ordering_operators() {
        let f = fixture().await;
        use DataType::*;
        use LogicalOperator::*;

        assert!(binary(&f, GreaterThan, Integer, json!(5), json!(3)).await);
        assert!(!binary(&f, GreaterThan, Integer, json!(3), json!(3)).await);
        assert!(binary(&f, GreaterThanOrEqual, Float, json!(3.0), json!(3.0)).await);
        assert!(binary(&f, LessThan, Float, json!(1.5), json!(2.0)).await);
        assert!(!binary(&f, LessThan, Float, json!(2.5), json!(2.0)).await);
        assert!(binary(&f, LessThanOrEqual, Text, json!("apple"), json!("banana")).await);
        assert!(binary(&f, GreaterThan, Date, json!("2024-02-01"), json!("2024-01-31")).await);
    }

    #[tokio::test]
    async fn test_between_is_inclusive() {
        let f = fixture().await;
        let between = |value: Value| {
            Condition::logical(
                LogicalOperator::Between,
                lit(DataType::Integer, value),
                Some(lit(DataType::Integer, json!(1))),
            )
            .with_third(lit(DataType::Integer, json!(10)))
        };
        assert!(check(&f, between(json!(1))).await);
        assert!(check(&f, between(json!(10))).await);
        assert!(!check(&f, between(json!(11))).await);
    }

    #[tokio::test]
    async fn test_is_true_and_is_false() {
        let f = fixture().await;
        let unary = |op: LogicalOperator, value: Value| Condition::logical(op, lit(DataType::Boolean, value), None);

        assert!(check(&f, unary(LogicalOperator::IsTrue, json!(true))).await);
        assert!(!check(&f, unary(LogicalOperator::IsTrue, json!(false))).await);
        assert!(check(&f, unary(LogicalOperator::IsFalse, json!(false))).await);
        assert!(!check(&f, unary(LogicalOperator::IsFalse, json!(true))).await);
    }

    #[tokio::test]
    async fn test_in_checks_first_value_membership() {
        let f = fixture().await;
        let condition = |value: Value| {
            Condition::logical(
                LogicalOperator::In,
                lit(DataType::Text, value),
                Some(lit(DataType::Array, json!(["red", "green"]))),
            )
        };
        assert!(check(&f, condition(json!("Green"))).await);
        assert!(!check(&f, condition(json!("blue"))).await);
    }

    #[tokio::test]
    async fn test_contains_and_does_not_contain() {
        let f = fixture().await;
        use LogicalOperator::*;

        assert!(binary(&f, Contains, DataType::Text, json!("Hello World"), json!("world")).await);
        assert!(!binary(&f, Contains, DataType::Text, json!("Hello"), json!("bye")).await);
        assert!(binary(&f, DoesNotContain, DataType::Text, json!("Hello"), json!("bye")).await);

        let array_contains = Condition::logical(
            Contains,
            lit(DataType::Array, json!([1, 2, 3])),
            Some(lit(DataType::Integer, json!(2))),
        );
        assert!(check(&f, array_contains).await);
    }

    #[tokio::test]
    async fn test_exists_uses_almanac() {
        let f = fixture().await;
        let condition = Condition::logical(
            LogicalOperator::Exists,
            Operand::almanac(DataType::Text, "name"),
            None,
        );
        assert!(!check(&f, condition.clone()).await);

        f.almanac.add_fact("name", json!("Ada")).await.unwrap();
        assert!(check(&f, condition).await);
    }

    #[tokio::test]
    async fn test_consecutive_occurrences() {
        let f = fixture().await;
        let condition = |run: i64| {
            Condition::logical(
                LogicalOperator::HasConsecutiveOccurrences,
                lit(DataType::Array, json!(["no", "yes", "yes", "no", "yes"])),
                Some(lit(DataType::Text, json!("yes"))),
            )
            .with_third(lit(DataType::Integer, json!(run)))
        };
        assert!(check(&f, condition(2)).await);
        assert!(!check(&f, condition(3)).await);
    }

    #[tokio::test]
    async fn test_ranges_overlap() {
        let f = fixture().await;
        use LogicalOperator::RangesOverlap;

        assert!(binary(&f, RangesOverlap, DataType::Array, json!([1, 5]), json!([5, 9])).await);
        assert!(!binary(&f, RangesOverlap, DataType::Array, json!([1, 4]), json!([5, 9])).await);
        assert!(
            binary(
                &f,
                RangesOverlap,
                DataType::Array,
                json!(["2024-01-01", "2024-01-10"]),
                json!(["2024-01-05", "2024-02-01"])
            )
            .await
        );
    }

    #[tokio::test]
    async fn test_almanac_boolean_coercion() {
        let f = fixture().await;
        f.almanac.add_fact("subscribed", json!("yes")).await.unwrap();
        let condition = Condition::logical(
            LogicalOperator::IsTrue,
            Operand::almanac(DataType::Boolean, "subscribed"),
            None,
        );
        assert!(check(&f, condition).await);
    }

    #[tokio::test]
    async fn test_argument_overrides_first_operand() {
        let f = fixture().await;
        let condition = Condition::logical(
            LogicalOperator::Equal,
            Operand::named("ChosenOption", DataType::Text),
            Some(lit(DataType::Text, json!("Yes"))),
        );
        let yes = json!("yes");
        let no = json!("No");
        assert!(f.evaluator.evaluate(&condition, &f.almanac, None, Some(&yes)).await.unwrap());
        assert!(!f.evaluator.evaluate(&condition, &f.almanac, None, Some(&no)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unparsable_answer_is_no_match() {
        let f = fixture().await;
        let condition = Condition::logical(
            LogicalOperator::IsTrue,
            Operand::named("Answer", DataType::Boolean),
            None,
        );
        let answer = json!("yes");
        let report = f
            .evaluator
            .evaluate_detailed(&condition, &f.almanac, None, Some(&answer))
            .await
            .unwrap();
        assert!(!report.passed);
        assert!(report.explanation.contains("treated as no match"), "{}", report.explanation);

        let numeric = Condition::logical(
            LogicalOperator::GreaterThan,
            Operand::named("Answer", DataType::Integer),
            Some(lit(DataType::Integer, json!(3))),
        );
        let text = json!("a few");
        assert!(!f.evaluator.evaluate(&numeric, &f.almanac, None, Some(&text)).await.unwrap());
    }

    #[tokio::test]
    async fn test_exists_on_boolean_fact() {
        let f = fixture().await;
        let condition = Condition::logical(
            LogicalOperator::Exists,
            Operand::almanac(DataType::Boolean, "paid"),
            None,
        );
        assert!(!check(&f, condition.clone()).await);

        f.almanac.add_fact("paid", json!(false)).await.unwrap();
        assert!(check(&f, condition).await);
    }

    async fn composite(f: &Fixture, op: CompositionOperator, children: &[bool]) -> ConditionEvaluation {
        let parent = f
            .storage
            .create_condition(Condition::composition(op))
            .await
            .unwrap();
        for (index, value) in children.iter().enumerate() {
            let child = Condition::logical(LogicalOperator::IsTrue, lit(DataType::Boolean, json!(value)), None)
                .child_of(parent.id, index as u32);
            f.storage.create_condition(child).await.unwrap();
        }
        f.evaluator
            .evaluate_detailed(&parent, &f.almanac, None, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_and_short_circuits() {
        let f = fixture().await;
        let report = composite(&f, CompositionOperator::And, &[false, true]).await;
        assert!(!report.passed);
        assert_eq!(report.children.len(), 1);

        let report = composite(&f, CompositionOperator::And, &[true, true]).await;
        assert!(report.passed);
        assert_eq!(report.children.len(), 2);
    }

    #[tokio::test]
    async fn test_or_short_circuits() {
        let f = fixture().await;
        let report = composite(&f, CompositionOperator::Or, &[true, false]).await;
        assert!(report.passed);
        assert_eq!(report.children.len(), 1);
        assert!(!composite(&f, CompositionOperator::Or, &[false, false]).await.passed);
    }

    #[tokio::test]
    async fn test_xor_and_none() {
        let f = fixture().await;
        assert!(composite(&f, CompositionOperator::Xor, &[false, true, false]).await.passed);
        assert!(!composite(&f, CompositionOperator::Xor, &[true, true]).await.passed);
        assert!(!composite(&f, CompositionOperator::None, &[true]).await.passed);
        assert!(!composite(&f, CompositionOperator::And, &[]).await.passed);
    }

    #[tokio::test]
    async fn test_unsupported_operators_error() {
        let f = fixture().await;
        let unknown = Condition::logical(
            LogicalOperator::Unsupported("Matches".to_string()),
            lit(DataType::Text, json!("a")),
            None,
        );
        assert!(matches!(
            f.evaluator.evaluate(&unknown, &f.almanac, None, None).await,
            Err(FlowgateError::UnsupportedOperation(_))
        ));

        let mut math = Condition::composition(CompositionOperator::And);
        math.operator_type = OperatorType::Mathematical;
        assert!(matches!(
            f.evaluator.evaluate(&math, &f.almanac, None, None).await,
            Err(FlowgateError::UnsupportedOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_literal_is_parse_error() {
        let f = fixture().await;
        let condition = Condition::logical(
            LogicalOperator::GreaterThan,
            lit(DataType::Integer, json!("many")),
            Some(lit(DataType::Integer, json!(1))),
        );
        assert!(matches!(
            f.evaluator.evaluate(&condition, &f.almanac, None, None).await,
            Err(FlowgateError::Parse(_))
        ));
    }
}
