//! Classes and their special-method tables.
//!
//! Operators and protocols never look up `__add__`, `__iter__` and friends by name at
//! dispatch time. Each class carries a table indexed by [`SpecialMethod`], filled when
//! the class is finalized by walking the base chain, so inherited methods are found
//! without a hash lookup per operation.

use strum::{EnumCount, EnumIter, IntoStaticStr};

use crate::{heap::HeapId, table::Table, value::Value};

/// Special methods with a dedicated slot in every class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter, IntoStaticStr)]
pub enum SpecialMethod {
    #[strum(serialize = "__new__")]
    New,
    #[strum(serialize = "__init__")]
    Init,
    #[strum(serialize = "__repr__")]
    Repr,
    #[strum(serialize = "__str__")]
    Str,
    #[strum(serialize = "__hash__")]
    Hash,
    #[strum(serialize = "__eq__")]
    Eq,
    #[strum(serialize = "__lt__")]
    Lt,
    #[strum(serialize = "__gt__")]
    Gt,
    #[strum(serialize = "__le__")]
    Le,
    #[strum(serialize = "__ge__")]
    Ge,
    #[strum(serialize = "__len__")]
    Len,
    #[strum(serialize = "__getitem__")]
    GetItem,
    #[strum(serialize = "__setitem__")]
    SetItem,
    #[strum(serialize = "__delitem__")]
    DelItem,
    #[strum(serialize = "__contains__")]
    Contains,
    #[strum(serialize = "__iter__")]
    Iter,
    #[strum(serialize = "__enter__")]
    Enter,
    #[strum(serialize = "__exit__")]
    Exit,
    #[strum(serialize = "__call__")]
    Call,
    #[strum(serialize = "__get__")]
    Get,
    #[strum(serialize = "__set__")]
    Set,
    #[strum(serialize = "__getattr__")]
    GetAttr,
    #[strum(serialize = "__bool__")]
    Bool,
    #[strum(serialize = "__neg__")]
    Neg,
    #[strum(serialize = "__add__")]
    Add,
    #[strum(serialize = "__sub__")]
    Sub,
    #[strum(serialize = "__mul__")]
    Mul,
    #[strum(serialize = "__truediv__")]
    TrueDiv,
    #[strum(serialize = "__floordiv__")]
    FloorDiv,
    #[strum(serialize = "__mod__")]
    Mod,
    #[strum(serialize = "__radd__")]
    RAdd,
    #[strum(serialize = "__rsub__")]
    RSub,
    #[strum(serialize = "__rmul__")]
    RMul,
    #[strum(serialize = "__rtruediv__")]
    RTrueDiv,
    #[strum(serialize = "__rfloordiv__")]
    RFloorDiv,
    #[strum(serialize = "__rmod__")]
    RMod,
}

/// Groups of special methods that together make up one capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Lifecycle,
    Representation,
    Hashable,
    Comparable,
    Container,
    Iterable,
    ContextManager,
    Callable,
    Descriptor,
    Attribute,
    Numeric,
}

impl SpecialMethod {
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    #[must_use]
    pub fn protocol(self) -> Protocol {
        match self {
            Self::New | Self::Init => Protocol::Lifecycle,
            Self::Repr | Self::Str => Protocol::Representation,
            Self::Hash => Protocol::Hashable,
            Self::Eq | Self::Lt | Self::Gt | Self::Le | Self::Ge => Protocol::Comparable,
            Self::Len | Self::GetItem | Self::SetItem | Self::DelItem | Self::Contains => Protocol::Container,
            Self::Iter => Protocol::Iterable,
            Self::Enter | Self::Exit => Protocol::ContextManager,
            Self::Call => Protocol::Callable,
            Self::Get | Self::Set => Protocol::Descriptor,
            Self::GetAttr => Protocol::Attribute,
            Self::Bool
            | Self::Neg
            | Self::Add
            | Self::Sub
            | Self::Mul
            | Self::TrueDiv
            | Self::FloorDiv
            | Self::Mod
            | Self::RAdd
            | Self::RSub
            | Self::RMul
            | Self::RTrueDiv
            | Self::RFloorDiv
            | Self::RMod => Protocol::Numeric,
        }
    }

    /// Reflected counterpart of a binary operator, tried on the right operand.
    #[must_use]
    pub fn reflected(self) -> Option<Self> {
        Some(match self {
            Self::Add => Self::RAdd,
            Self::Sub => Self::RSub,
            Self::Mul => Self::RMul,
            Self::TrueDiv => Self::RTrueDiv,
            Self::FloorDiv => Self::RFloorDiv,
            Self::Mod => Self::RMod,
            _ => return None,
        })
    }
}

/// Native payload carried by instances of a class and of all its subclasses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, IntoStaticStr)]
pub enum InstanceKind {
    #[default]
    Plain,
    List,
    Dict,
    Set,
    Generator,
    Exception,
    Iterator,
    Slice,
}

/// The special-method table of a finalized class.
pub type SpecialTable = [Option<Value>; SpecialMethod::COUNT];

#[derive(Debug, Clone)]
pub struct Class {
    pub name: HeapId,
    pub filename: Option<HeapId>,
    pub doc: Option<HeapId>,
    pub base: Option<HeapId>,
    pub methods: Table,
    /// Direct subclasses. Not traced by the collector; a freed subclass removes itself.
    pub subclasses: Vec<HeapId>,
    pub kind: InstanceKind,
    specials: SpecialTable,
    /// Defines `__eq__` more recently in the chain than `__hash__`.
    unhashable: bool,
}

impl Class {
    #[must_use]
    pub fn new(name: HeapId, base: Option<HeapId>, kind: InstanceKind) -> Self {
        Self {
            name,
            filename: None,
            doc: None,
            base,
            methods: Table::new(),
            subclasses: Vec::new(),
            kind,
            specials: [None; SpecialMethod::COUNT],
            unhashable: false,
        }
    }

    #[inline]
    #[must_use]
    pub fn special(&self, method: SpecialMethod) -> Option<Value> {
        self.specials[method as usize]
    }

    /// Installs a freshly computed table.
    pub fn set_specials(&mut self, specials: SpecialTable, unhashable: bool) {
        self.specials = specials;
        self.unhashable = unhashable;
    }

    #[must_use]
    pub fn is_unhashable(&self) -> bool {
        self.unhashable
    }

    /// Whether instances implement at least one method of `protocol`.
    #[must_use]
    pub fn supports(&self, protocol: Protocol) -> bool {
        if protocol == Protocol::Hashable && self.unhashable {
            return false;
        }
        self.specials
            .iter()
            .zip(<SpecialMethod as strum::IntoEnumIterator>::iter())
            .any(|(slot, method)| slot.is_some() && method.protocol() == protocol)
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        self.methods.capacity() * size_of::<(Value, Value)>() + self.subclasses.len() * size_of::<HeapId>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_dunder_forms() {
        assert_eq!(SpecialMethod::Init.name(), "__init__");
        assert_eq!(SpecialMethod::RFloorDiv.name(), "__rfloordiv__");
    }

    #[test]
    fn reflected_operators() {
        assert_eq!(SpecialMethod::Sub.reflected(), Some(SpecialMethod::RSub));
        assert_eq!(SpecialMethod::Eq.reflected(), None);
    }

    #[test]
    fn protocols_follow_the_special_table() {
        let mut class = Class::new(HeapId::from_index(0), None, InstanceKind::Plain);
        assert!(!class.supports(Protocol::Callable));

        let mut specials = [None; SpecialMethod::COUNT];
        specials[SpecialMethod::Call as usize] = Some(Value::None);
        specials[SpecialMethod::Hash as usize] = Some(Value::None);
        class.set_specials(specials, true);
        assert!(class.supports(Protocol::Callable));
        assert!(!class.supports(Protocol::Hashable), "unhashable wins over an inherited __hash__");
        assert!(!class.supports(Protocol::ContextManager));
    }
}
