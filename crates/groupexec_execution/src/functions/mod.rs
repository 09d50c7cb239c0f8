pub mod aggregate;

use groupexec_row::datatype::DataType;

/// Declared signature of a function: exact argument types (possibly `Any`)
/// and the produced type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub arg_types: Vec<DataType>,
    pub return_type: DataType,
}

impl Signature {
    pub fn matches(&self, inputs: &[DataType]) -> bool {
        self.arg_types.len() == inputs.len()
            && self
                .arg_types
                .iter()
                .zip(inputs)
                .all(|(decl, input)| decl.accepts(input))
    }
}
