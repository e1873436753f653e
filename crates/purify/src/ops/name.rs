//! Qualified operator names such as `aten::add_.Tensor`.

use std::fmt;

/// Fully qualified operator name: `namespace::base[.overload]`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct OpName(&'static str);

impl OpName {
    pub const fn new(qualified: &'static str) -> Self {
        OpName(qualified)
    }

    pub fn as_str(self) -> &'static str {
        self.0
    }

    /// Namespace portion (`aten` in `aten::add_.Tensor`); empty when unqualified.
    pub fn namespace(self) -> &'static str {
        match self.0.split_once("::") {
            Some((namespace, _)) => namespace,
            None => "",
        }
    }

    /// Operator base name without namespace or overload (`add_`).
    pub fn base(self) -> &'static str {
        let unqualified = match self.0.split_once("::") {
            Some((_, rest)) => rest,
            None => self.0,
        };
        match unqualified.split_once('.') {
            Some((base, _)) => base,
            None => unqualified,
        }
    }

    /// Overload suffix (`Tensor` in `aten::add_.Tensor`).
    pub fn overload(self) -> Option<&'static str> {
        let unqualified = match self.0.split_once("::") {
            Some((_, rest)) => rest,
            None => self.0,
        };
        unqualified.split_once('.').map(|(_, overload)| overload)
    }

    /// In-place variants follow the trailing-underscore naming convention.
    pub fn is_inplace(self) -> bool {
        let base = self.base();
        base.len() > 1 && base.ends_with('_') && !base.starts_with("__")
    }

    /// `out=` variants write into a caller-provided tensor.
    pub fn is_out_variant(self) -> bool {
        self.overload()
            .is_some_and(|overload| overload == "out" || overload.ends_with("_out"))
    }

    /// Base name of the non-mutating counterpart (`add` for `add_`).
    pub fn functional_base(self) -> &'static str {
        let base = self.base();
        if self.is_inplace() {
            &base[..base.len() - 1]
        } else {
            base
        }
    }
}

impl fmt::Display for OpName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Operators that only read tensor metadata. Wrappers answer these from their inner handle.
pub mod metadata {
    use super::OpName;

    pub const SIZE: OpName = OpName::new("aten::size");
    pub const SYM_SIZE: OpName = OpName::new("aten::sym_size");
    pub const STRIDE: OpName = OpName::new("aten::stride");
    pub const SYM_STRIDE: OpName = OpName::new("aten::sym_stride");
    pub const STORAGE_OFFSET: OpName = OpName::new("aten::storage_offset");
    pub const SYM_STORAGE_OFFSET: OpName = OpName::new("aten::sym_storage_offset");
    pub const NUMEL: OpName = OpName::new("aten::numel");
    pub const SYM_NUMEL: OpName = OpName::new("aten::sym_numel");
    pub const DIM: OpName = OpName::new("aten::dim");
    pub const IS_CONTIGUOUS: OpName = OpName::new("aten::is_contiguous");
    pub const IS_CONTIGUOUS_MEMORY_FORMAT: OpName =
        OpName::new("aten::is_contiguous.memory_format");
    pub const IS_STRIDES_LIKE_FORMAT: OpName = OpName::new("aten::is_strides_like_format");
    pub const IS_NON_OVERLAPPING_AND_DENSE: OpName =
        OpName::new("aten::is_non_overlapping_and_dense");
}

#[cfg(test)]
mod tests {
    use super::OpName;

    #[test]
    fn splits_qualified_names() {
        let op = OpName::new("aten::add_.Tensor");
        assert_eq!(op.namespace(), "aten");
        assert_eq!(op.base(), "add_");
        assert_eq!(op.overload(), Some("Tensor"));
        assert!(op.is_inplace());
        assert_eq!(op.functional_base(), "add");
    }

    #[test]
    fn recognizes_out_variants_and_dunders() {
        assert!(OpName::new("aten::add.out").is_out_variant());
        assert!(!OpName::new("aten::add.out").is_inplace());
        assert!(!OpName::new("aten::__and__").is_inplace());
        assert_eq!(OpName::new("relu").base(), "relu");
        assert_eq!(OpName::new("relu").namespace(), "");
    }
}
