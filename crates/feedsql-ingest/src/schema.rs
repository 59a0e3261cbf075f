//! Schema compiler
//!
//! Turns the field descriptors of a configuration into:
//!
//! - the primary table definition, one column per descriptor, in order
//! - one [`ReferenceTable`] per `REFTABLE` descriptor
//! - one [`FieldBinding`] per descriptor, pairing the parsed expression with
//!   the column (or reference table) it feeds
//!
//! The result is a plain, caller-owned [`CompiledSchema`]. Nothing is
//! registered globally, so compiling the same descriptors twice yields two
//! equal, independent schemas.

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{FieldDescriptor, SchemaConfig};
use crate::error::{IngestError, Result};
use crate::expr::Expression;
use crate::extract::{BindingTarget, FieldBinding};

/// Pseudo-type that declares a reference field
pub const REFERENCE_TYPE: &str = "REFTABLE";

/// Surrogate key column of every reference table
pub const REFERENCE_KEY_COLUMN: &str = "id";

/// Value column of every reference table
pub const REFERENCE_VALUE_COLUMN: &str = "value";

/// Storage type of a column
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StorageType {
    Text { length: Option<u32> },
    Varchar { length: Option<u32> },
    Char { length: Option<u32> },
    Integer,
    SmallInteger,
    BigInteger,
    Float { precision: Option<u32> },
    Real,
    Numeric { precision: Option<u32>, scale: Option<u32> },
    Boolean,
    Date,
    DateTime,
}

/// Value family a storage type accepts, used for coercion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFamily {
    Text,
    Integer,
    Real,
    Boolean,
    Date,
    DateTime,
}

impl StorageType {
    /// Resolve a type name and its positional parameters.
    ///
    /// `field` is only used for error messages.
    pub fn resolve(field: &str, type_name: &str, params: &[serde_yaml::Value]) -> Result<Self> {
        let name = type_name.trim().to_ascii_uppercase();
        let max_params = match name.as_str() {
            "NUMERIC" | "DECIMAL" => 2,
            "TEXT" | "STRING" | "VARCHAR" | "CHAR" | "FLOAT" => 1,
            "INT" | "INTEGER" | "SMALLINT" | "SMALLINTEGER" | "BIGINT" | "BIGINTEGER" | "REAL"
            | "DOUBLE" | "BOOLEAN" | "BOOL" | "DATE" | "DATETIME" | "TIMESTAMP" => 0,
            _ => {
                return Err(IngestError::UnknownType {
                    field: field.to_string(),
                    type_name: type_name.to_string(),
                })
            },
        };

        if params.len() > max_params {
            return Err(IngestError::config(format!(
                "Field '{}': type {} takes at most {} parameter(s), got {}",
                field,
                name,
                max_params,
                params.len()
            )));
        }

        let param = |i: usize| -> Result<Option<u32>> {
            match params.get(i) {
                None => Ok(None),
                Some(v) => v.as_u64().and_then(|n| u32::try_from(n).ok()).map(Some).ok_or_else(|| {
                    IngestError::config(format!(
                        "Field '{}': parameter {} of type {} must be a non-negative integer, got {:?}",
                        field,
                        i + 1,
                        name,
                        v
                    ))
                }),
            }
        };

        let storage_type = match name.as_str() {
            "TEXT" => StorageType::Text { length: param(0)? },
            "STRING" | "VARCHAR" => StorageType::Varchar { length: param(0)? },
            "CHAR" => StorageType::Char { length: param(0)? },
            "INT" | "INTEGER" => StorageType::Integer,
            "SMALLINT" | "SMALLINTEGER" => StorageType::SmallInteger,
            "BIGINT" | "BIGINTEGER" => StorageType::BigInteger,
            "FLOAT" => StorageType::Float { precision: param(0)? },
            "REAL" | "DOUBLE" => StorageType::Real,
            "NUMERIC" | "DECIMAL" => StorageType::Numeric {
                precision: param(0)?,
                scale: param(1)?,
            },
            "BOOLEAN" | "BOOL" => StorageType::Boolean,
            "DATE" => StorageType::Date,
            _ => StorageType::DateTime,
        };

        Ok(storage_type)
    }

    pub fn family(&self) -> StorageFamily {
        match self {
            StorageType::Text { .. } | StorageType::Varchar { .. } | StorageType::Char { .. } => {
                StorageFamily::Text
            },
            StorageType::Integer | StorageType::SmallInteger | StorageType::BigInteger => {
                StorageFamily::Integer
            },
            StorageType::Float { .. } | StorageType::Real | StorageType::Numeric { .. } => {
                StorageFamily::Real
            },
            StorageType::Boolean => StorageFamily::Boolean,
            StorageType::Date => StorageFamily::Date,
            StorageType::DateTime => StorageFamily::DateTime,
        }
    }

    /// DDL spelling, with parameters rendered positionally
    pub fn sql(&self) -> String {
        fn with_args(name: &str, args: &[Option<u32>]) -> String {
            let args: Vec<String> = args.iter().flatten().map(|a| a.to_string()).collect();
            if args.is_empty() {
                name.to_string()
            } else {
                format!("{}({})", name, args.join(", "))
            }
        }

        match self {
            StorageType::Text { length } => with_args("TEXT", &[*length]),
            StorageType::Varchar { length } => with_args("VARCHAR", &[*length]),
            StorageType::Char { length } => with_args("CHAR", &[*length]),
            StorageType::Integer => "INTEGER".to_string(),
            StorageType::SmallInteger => "SMALLINT".to_string(),
            StorageType::BigInteger => "BIGINT".to_string(),
            StorageType::Float { precision } => with_args("FLOAT", &[*precision]),
            StorageType::Real => "REAL".to_string(),
            StorageType::Numeric { precision, scale } => with_args("NUMERIC", &[*precision, *scale]),
            StorageType::Boolean => "BOOLEAN".to_string(),
            StorageType::Date => "DATE".to_string(),
            StorageType::DateTime => "DATETIME".to_string(),
        }
    }
}

/// Foreign key target of a column
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyDef {
    pub table: String,
    pub column: String,
}

/// A resolved column
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    pub name: String,
    pub storage_type: StorageType,
    pub nullable: bool,
    pub primary_key: bool,
    pub autoincrement: bool,
    pub indexed: bool,
    pub unique: bool,
    pub references: Option<ForeignKeyDef>,
}

impl ColumnDef {
    /// Whether a null value is acceptable when building a row.
    ///
    /// Autoincrement keys may be left null; the engine assigns them.
    pub fn accepts_null(&self) -> bool {
        self.nullable || (self.primary_key && self.autoincrement)
    }
}

/// Table name plus ordered columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn primary_key_columns(&self) -> Vec<&ColumnDef> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }

    /// Columns that identify a row for upsert: the primary key, or failing
    /// that the first unique column. An engine-assigned autoincrement key
    /// never identifies an item, so it falls through to the unique column.
    /// Empty means rows are only appended.
    pub fn conflict_columns(&self) -> Vec<&ColumnDef> {
        let keys = self.primary_key_columns();
        let generated = keys.len() == 1 && keys[0].autoincrement;
        if !keys.is_empty() && !generated {
            return keys;
        }
        self.columns.iter().filter(|c| c.unique).take(1).collect()
    }
}

/// A deduplicating lookup table owned by one reference field.
///
/// Every reference table has the same shape: an autoincrement surrogate key
/// and one unique value column of the field's declared reference type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceTable {
    /// Field of the primary table this table serves
    pub field: String,
    pub name: String,
    pub value_type: StorageType,
}

impl ReferenceTable {
    pub fn new(primary_table: &str, field: &str, value_type: StorageType) -> Self {
        Self {
            field: field.to_string(),
            name: reference_table_name(primary_table, field),
            value_type,
        }
    }

    pub fn table_def(&self) -> TableDef {
        TableDef {
            name: self.name.clone(),
            columns: vec![
                ColumnDef {
                    name: REFERENCE_KEY_COLUMN.to_string(),
                    storage_type: StorageType::Integer,
                    nullable: false,
                    primary_key: true,
                    autoincrement: true,
                    indexed: false,
                    unique: false,
                    references: None,
                },
                ColumnDef {
                    name: REFERENCE_VALUE_COLUMN.to_string(),
                    storage_type: self.value_type.clone(),
                    nullable: false,
                    primary_key: false,
                    autoincrement: false,
                    indexed: false,
                    unique: true,
                    references: None,
                },
            ],
        }
    }
}

/// Deterministic name of the reference table for `field`
pub fn reference_table_name(primary_table: &str, field: &str) -> String {
    format!("{}_REF_{}", primary_table, field)
}

/// Everything the pipeline and storage layer need, compiled once at startup
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    pub primary: TableDef,
    pub references: Vec<ReferenceTable>,
    pub bindings: Vec<FieldBinding>,
}

impl CompiledSchema {
    pub fn reference(&self, field: &str) -> Option<&ReferenceTable> {
        self.references.iter().find(|r| r.field == field)
    }

    /// All table definitions, reference tables first (they are FK targets)
    pub fn table_defs(&self) -> Vec<TableDef> {
        self.references
            .iter()
            .map(ReferenceTable::table_def)
            .chain(std::iter::once(self.primary.clone()))
            .collect()
    }
}

/// Compile the schema section of a configuration
pub fn compile(schema: &SchemaConfig) -> Result<CompiledSchema> {
    compile_fields(&schema.fields, &schema.table)
}

/// Compile field descriptors for `table_name`, in input order.
///
/// Fails on the first unknown type, bad parameter list or unparsable
/// expression; no partial schema is returned.
pub fn compile_fields(fields: &[FieldDescriptor], table_name: &str) -> Result<CompiledSchema> {
    let mut columns = Vec::with_capacity(fields.len());
    let mut references = Vec::new();
    let mut bindings = Vec::with_capacity(fields.len());

    for field in fields {
        let expression = Expression::parse(&field.value_expression).map_err(|e| {
            IngestError::config(format!("Field '{}': invalid expression: {}", field.name, e))
        })?;

        if field.is_reference() {
            let (ref_type_name, ref_params) = field.reference_type()?;
            if ref_type_name.eq_ignore_ascii_case(REFERENCE_TYPE) {
                return Err(IngestError::config(format!(
                    "Field '{}': reference fields cannot reference another REFTABLE",
                    field.name
                )));
            }
            let value_type = StorageType::resolve(&field.name, &ref_type_name, &ref_params)?;

            if field.primary_key || field.autoincrement || !field.nullable {
                warn!(
                    field = %field.name,
                    "primary_key/autoincrement/nullable are ignored on reference fields"
                );
            }

            let reference = ReferenceTable::new(table_name, &field.name, value_type);
            columns.push(ColumnDef {
                name: field.name.clone(),
                storage_type: StorageType::Integer,
                nullable: false,
                primary_key: false,
                autoincrement: false,
                indexed: field.indexed,
                unique: field.unique,
                references: Some(ForeignKeyDef {
                    table: reference.name.clone(),
                    column: REFERENCE_KEY_COLUMN.to_string(),
                }),
            });
            bindings.push(FieldBinding {
                field: field.name.clone(),
                expression,
                target: BindingTarget::Reference(references.len()),
            });
            debug!(field = %field.name, table = %reference.name, "Compiled reference field");
            references.push(reference);
        } else {
            let params = field.type_parameter_list();
            let storage_type = StorageType::resolve(&field.name, &field.sql_type, &params)?;

            columns.push(ColumnDef {
                name: field.name.clone(),
                storage_type: storage_type.clone(),
                nullable: field.nullable && !field.primary_key,
                primary_key: field.primary_key,
                autoincrement: field.autoincrement,
                indexed: field.indexed,
                unique: field.unique,
                references: None,
            });
            bindings.push(FieldBinding {
                field: field.name.clone(),
                expression,
                target: BindingTarget::Column(storage_type),
            });
        }
    }

    let autoincrement_keys = columns
        .iter()
        .filter(|c| c.primary_key && c.autoincrement)
        .count();
    let keys = columns.iter().filter(|c| c.primary_key).count();
    if autoincrement_keys > 0 {
        let integer_key = columns
            .iter()
            .any(|c| c.primary_key && c.autoincrement && c.storage_type.family() == StorageFamily::Integer);
        if keys > 1 || !integer_key {
            return Err(IngestError::config(
                "autoincrement requires a single integer primary key column",
            ));
        }
    }

    Ok(CompiledSchema {
        primary: TableDef {
            name: table_name.to_string(),
            columns,
        },
        references,
        bindings,
    })
}
