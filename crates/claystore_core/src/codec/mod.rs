//! Document codec: splits exported documents for storage and inflates
//! stored records back into model instances.

pub mod document;
