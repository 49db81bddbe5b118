//! # Payload Schemas
//!
//! A [`Schema<T>`] decodes a JSON payload into `T` and then applies any
//! number of named rules. Decoding failures and rule violations are both
//! [`JobflowError::Validation`].

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{JobflowError, JobflowResult};

type Rule<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

pub struct Schema<T> {
    rules: Vec<(String, Rule<T>)>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Schema<T> {
    fn clone(&self) -> Self {
        Self {
            rules: self.rules.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Schema<T> {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Schema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("type", &std::any::type_name::<T>())
            .field(
                "rules",
                &self.rules.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<T> Schema<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule; `description` is reported when `check` returns false.
    pub fn rule<F>(mut self, description: impl Into<String>, check: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.rules.push((description.into(), Arc::new(check)));
        self
    }

    /// Apply the rules to an already typed value.
    pub fn check(&self, value: &T) -> JobflowResult<()> {
        for (description, rule) in &self.rules {
            if !rule(value) {
                return Err(JobflowError::validation(format!(
                    "{}: {description}",
                    std::any::type_name::<T>()
                )));
            }
        }
        Ok(())
    }

    /// Decode a JSON payload and apply the rules.
    pub fn parse(&self, value: Value) -> JobflowResult<T> {
        let typed: T = serde_json::from_value(value).map_err(|e| {
            JobflowError::validation(format!(
                "payload does not match {}: {e}",
                std::any::type_name::<T>()
            ))
        })?;
        self.check(&typed)?;
        Ok(typed)
    }

    /// Check a typed value and encode it as JSON.
    pub fn encode(&self, value: &T) -> JobflowResult<Value> {
        self.check(value)?;
        Ok(serde_json::to_value(value)?)
    }
}

/// Decode `value` through `schema` when present; plain serde decoding otherwise.
pub fn decode_optional<T>(schema: Option<&Schema<T>>, value: Value) -> JobflowResult<T>
where
    T: Serialize + DeserializeOwned,
{
    match schema {
        Some(schema) => schema.parse(value),
        None => serde_json::from_value(value).map_err(|e| {
            JobflowError::validation(format!(
                "result does not decode as {}: {e}",
                std::any::type_name::<T>()
            ))
        }),
    }
}

/// Encode `value`, checking it against `schema` when present.
pub fn encode_optional<T>(schema: Option<&Schema<T>>, value: &T) -> JobflowResult<Value>
where
    T: Serialize + DeserializeOwned,
{
    match schema {
        Some(schema) => schema.encode(value),
        None => Ok(serde_json::to_value(value)?),
    }
}
