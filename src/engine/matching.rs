// Event → schema / schema instance resolution

//! # Instance Matching
//!
//! An inbound event names its schema and instance explicitly or not at all.
//! When the instance is not named, every live instance of the schema is
//! scored by how many of its bound context params agree with the event:
//!
//! | Param type | Matches when |
//! |---|---|
//! | `Phonenumber` | digits of both numbers are equal |
//! | `Location` | haversine distance ≤ threshold (meters) |
//! | `Date` / `DateTime` | event timestamp within the threshold window |
//! | reserved `SchemaInstanceCode` | exact code, selects the instance outright |
//! | anything else | loose JSON equality with the event's context value |
//!
//! A required param that does not match eliminates the candidate. Among the
//! survivors with at least one match the highest score wins; ties go to
//! the most recently created instance, then the greater id.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::engine::storage::WorkflowStorage;
use crate::models::{
    condition::{loose_json_eq, parse_datetime},
    ContextParam, DataType, Event, GeoLocation, Schema, SchemaInstance, SCHEMA_INSTANCE_CODE_PARAM,
};
use crate::settings::EngineConfig;
use crate::{FlowgateError, Result};

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Score {
    Certain,
    Eliminated,
    Matches(usize),
}

#[derive(Clone)]
pub struct InstanceMatcher {
    storage: Arc<dyn WorkflowStorage>,
    config: EngineConfig,
}

impl InstanceMatcher {
    pub fn new(storage: Arc<dyn WorkflowStorage>, config: EngineConfig) -> Self {
        Self { storage, config }
    }

    /// Explicit schema id, else the named instance's schema, else the tenant's first top-level schema
    pub async fn resolve_schema(&self, event: &Event) -> Result<Schema> {
        if let Some(schema_id) = event.schema_id {
            return self.tenant_schema(event, &schema_id).await;
        }
        if let Some(instance_id) = event.schema_instance_id {
            let instance = self
                .storage
                .get_schema_instance(&instance_id)
                .await?
                .filter(|instance| instance.tenant_id == event.tenant_id)
                .ok_or_else(|| FlowgateError::not_found("SchemaInstance", instance_id))?;
            return self.tenant_schema(event, &instance.schema_id).await;
        }
        self.storage
            .list_schemas(&event.tenant_id)
            .await?
            .into_iter()
            .find(Schema::is_top_level)
            .ok_or_else(|| {
                FlowgateError::not_found("Schema", format!("top-level schema of tenant {}", event.tenant_id))
            })
    }

    async fn tenant_schema(&self, event: &Event, schema_id: &uuid::Uuid) -> Result<Schema> {
        self.storage
            .get_schema(schema_id)
            .await?
            .filter(|schema| schema.tenant_id == event.tenant_id)
            .ok_or_else(|| FlowgateError::not_found("Schema", schema_id))
    }

    /// The instance the event continues, `None` when a new one should be created
    pub async fn resolve_instance(&self, schema: &Schema, event: &Event) -> Result<Option<SchemaInstance>> {
        if let Some(instance_id) = event.schema_instance_id {
            let instance = self
                .storage
                .get_schema_instance(&instance_id)
                .await?
                .ok_or_else(|| FlowgateError::not_found("SchemaInstance", instance_id))?;
            if instance.schema_id != schema.id {
                return Err(FlowgateError::Validation(format!(
                    "schema instance {} does not belong to schema {}",
                    instance_id, schema.id
                )));
            }
            if instance.terminated {
                return Err(FlowgateError::Validation(format!(
                    "schema instance {} is terminated",
                    instance_id
                )));
            }
            return Ok(Some(instance));
        }

        let mut best: Option<(usize, SchemaInstance)> = None;
        for candidate in self.storage.list_schema_instances(&schema.id).await? {
            if candidate.terminated {
                continue;
            }
            let matches = match self.score(&candidate, event) {
                Score::Certain => {
                    debug!(schema_instance_id = %candidate.id, "Instance selected by code");
                    return Ok(Some(candidate));
                }
                Score::Eliminated | Score::Matches(0) => continue,
                Score::Matches(n) => n,
            };
            let better = match &best {
                None => true,
                Some((top, current)) => match matches.cmp(top) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => {
                        (candidate.created_at, candidate.id) > (current.created_at, current.id)
                    }
                },
            };
            if better {
                best = Some((matches, candidate));
            }
        }

        if let Some((matches, instance)) = &best {
            debug!(schema_instance_id = %instance.id, matches, "Instance matched by context");
        }
        Ok(best.map(|(_, instance)| instance))
    }

    fn score(&self, instance: &SchemaInstance, event: &Event) -> Score {
        let mut matches = 0;
        for param in &instance.context_params {
            if param.is_instance_code() {
                if code_matches(param, event) {
                    return Score::Certain;
                }
                continue;
            }
            match self.param_matches(param, event) {
                Some(true) => matches += 1,
                _ if param.required => return Score::Eliminated,
                _ => {}
            }
        }
        Score::Matches(matches)
    }

    /// `None` when either side has no value to compare
    fn param_matches(&self, param: &ContextParam, event: &Event) -> Option<bool> {
        let bound = param.value.as_ref().filter(|value| !value.is_null())?;
        match param.param_type {
            DataType::Phonenumber => {
                let expected = normalize_phone(bound.as_str()?);
                let actual = normalize_phone(event.phone()?);
                Some(!expected.is_empty() && expected == actual)
            }
            DataType::Location => {
                let expected = GeoLocation::from_json(bound)?;
                let actual = event.location()?;
                let threshold = param
                    .threshold
                    .zip(param.threshold_unit)
                    .and_then(|(value, unit)| unit.to_meters(value))
                    .unwrap_or(self.config.default_location_threshold_meters);
                Some(haversine_meters(&expected, &actual) <= threshold)
            }
            DataType::Date | DataType::DateTime => {
                let expected = parse_datetime(bound.as_str()?)?;
                let window = param
                    .threshold
                    .zip(param.threshold_unit)
                    .and_then(|(value, unit)| unit.to_seconds(value))
                    .unwrap_or(self.config.default_time_window_secs as f64);
                let delta = (event.timestamp - expected).num_milliseconds().abs() as f64 / 1000.0;
                Some(delta <= window)
            }
            _ => {
                let actual = event.context_value(&param.name)?;
                Some(loose_json_eq(bound, &actual))
            }
        }
    }
}

fn code_matches(param: &ContextParam, event: &Event) -> bool {
    let Some(Value::String(code)) = &param.value else {
        return false;
    };
    let offered = event
        .context_value(SCHEMA_INSTANCE_CODE_PARAM)
        .and_then(|value| value.as_str().map(str::to_string))
        .or_else(|| event.text().map(str::to_string));
    matches!(offered, Some(offered) if offered.trim().eq_ignore_ascii_case(code))
}

fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

/// Great-circle distance between two coordinates
pub fn haversine_meters(a: &GeoLocation, b: &GeoLocation) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().asin()
}
