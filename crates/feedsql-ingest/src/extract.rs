//! Extraction engine
//!
//! Evaluates every field binding of a compiled schema against one feed item
//! and assembles the results into a [`Row`] of the primary table. Reference
//! fields go through the [`ReferenceResolver`]; the row stores the surrogate
//! key it returns, not the raw value.

use tracing::trace;

use crate::error::{ExtractionError, Result};
use crate::expr::Expression;
use crate::feed::FeedItem;
use crate::reference::ReferenceResolver;
use crate::row::{Row, RowBuilder};
use crate::schema::{CompiledSchema, StorageType};
use crate::value::Value;

/// A parsed expression and where its result goes
#[derive(Debug, Clone)]
pub struct FieldBinding {
    pub field: String,
    pub expression: Expression,
    pub target: BindingTarget,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindingTarget {
    /// Plain column; the value is coerced to this type
    Column(StorageType),
    /// Reference field; index into [`CompiledSchema::references`]
    Reference(usize),
}

/// Turns feed items into primary-table rows
pub struct ExtractionEngine<'a> {
    schema: &'a CompiledSchema,
    resolver: &'a ReferenceResolver,
}

impl<'a> ExtractionEngine<'a> {
    pub fn new(schema: &'a CompiledSchema, resolver: &'a ReferenceResolver) -> Self {
        Self { schema, resolver }
    }

    /// Evaluate only the plain columns of `item`; reference fields are left
    /// out. Touches no storage.
    pub fn evaluate(&self, item: &FeedItem) -> std::result::Result<Vec<(String, Value)>, ExtractionError> {
        self.schema
            .bindings
            .iter()
            .filter_map(|binding| match &binding.target {
                BindingTarget::Column(storage_type) => {
                    Some(evaluate_column(binding, storage_type, item).map(|v| (binding.field.clone(), v)))
                },
                BindingTarget::Reference(_) => None,
            })
            .collect()
    }

    /// Build the row for `item`.
    ///
    /// Plain columns are evaluated before any reference value is resolved,
    /// so an item that fails on a plain column never inserts reference rows.
    /// An [`ExtractionError`] is scoped to this item; any other error comes
    /// from the storage engine.
    pub async fn extract(&self, item: &FeedItem) -> Result<Row> {
        let mut builder = RowBuilder::new(&self.schema.primary);

        for (field, value) in self.evaluate(item)? {
            builder.set(&field, value)?;
        }

        let mut pending = Vec::new();
        for binding in &self.schema.bindings {
            if let BindingTarget::Reference(index) = binding.target {
                let reference = self.schema.references.get(index).ok_or_else(|| {
                    ExtractionError::evaluation(format!(
                        "no reference table for field '{}'",
                        binding.field
                    ))
                })?;
                let raw = binding
                    .expression
                    .evaluate(item)
                    .map_err(|e| e.in_field(&binding.field))?;
                if raw.is_null() {
                    return Err(ExtractionError::NullValue(binding.field.clone()).into());
                }
                let value = raw
                    .coerce(&reference.value_type)
                    .map_err(|e| e.in_field(&binding.field))?;
                pending.push((binding.field.as_str(), reference, value));
            }
        }

        for (field, reference, value) in pending {
            let id = self.resolver.resolve(reference, &value).await?;
            trace!(field = %field, value = %value, id, "Resolved reference");
            builder.set(field, Value::Integer(id))?;
        }

        Ok(builder.build()?)
    }
}

fn evaluate_column(
    binding: &FieldBinding,
    storage_type: &StorageType,
    item: &FeedItem,
) -> std::result::Result<Value, ExtractionError> {
    binding
        .expression
        .evaluate(item)
        .and_then(|value| value.coerce(storage_type))
        .map_err(|e| e.in_field(&binding.field))
}
