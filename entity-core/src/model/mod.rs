//! Entity objects, reference edges and model metadata

mod object;
mod schema;

pub use object::{EntityObject, EntityObjectReference, ReferenceScope, Values, timestamp};
pub use schema::{
    EntityModel, FieldDefinition, FieldError, FieldType, PlainConfig, RefCardinality,
    ValidationReport,
};
