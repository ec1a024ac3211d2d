//! Parsed type descriptors.
//!
//! A field descriptor like `[[Ljava/lang/String;` becomes a base type plus an
//! array-dimension count; a method descriptor like `(IJ)V` becomes a
//! parameter list and a return type with the total formal parameter size
//! precomputed.

use std::fmt::{self, Display, Formatter};

use crate::error::{CorruptKind, Result};

/// The base type of a descriptor, before array dimensions are applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BaseType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
    /// Only valid as a method return type.
    Void,
    /// Fully-qualified dotted class name, e.g. `java.lang.String`.
    Object(String),
}

impl BaseType {
    /// Formal size in local-variable slots: 2 for `long`/`double`, 0 for
    /// `void`, 1 for everything else.
    pub fn formal_size(&self) -> u32 {
        match self {
            BaseType::Void => 0,
            BaseType::Long | BaseType::Double => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Descriptor {
    base: BaseType,
    array_dimensions: u8,
}

impl Descriptor {
    pub fn new(base: BaseType, array_dimensions: u8) -> Self {
        debug_assert!(!matches!(base, BaseType::Void) || array_dimensions == 0);
        Descriptor {
            base,
            array_dimensions,
        }
    }

    /// Parses a single field descriptor from the start of `s`. Trailing
    /// characters are ignored, matching how descriptor strings are consumed
    /// out of NameAndType entries.
    pub fn parse(s: &str) -> Result<Descriptor> {
        Descriptor::read(&mut Chars::new(s))
    }

    fn read(chars: &mut Chars<'_>) -> Result<Descriptor> {
        let mut array_dimensions = 0u8;
        while chars.peek() == Some(b'[') {
            array_dimensions = array_dimensions
                .checked_add(1)
                .ok_or(CorruptKind::BadDescriptor)?;
            chars.bump();
        }

        let base = match chars.next().ok_or(CorruptKind::BadDescriptor)? {
            b'B' => BaseType::Byte,
            b'C' => BaseType::Char,
            b'D' => BaseType::Double,
            b'F' => BaseType::Float,
            b'I' => BaseType::Int,
            b'J' => BaseType::Long,
            b'S' => BaseType::Short,
            b'Z' => BaseType::Boolean,
            b'V' => {
                if array_dimensions > 0 {
                    return Err(CorruptKind::BadDescriptor.into());
                }
                BaseType::Void
            }
            b'L' => BaseType::Object(chars.class_name()?),
            _ => return Err(CorruptKind::BadDescriptor.into()),
        };

        Ok(Descriptor {
            base,
            array_dimensions,
        })
    }

    /// Maps the 1-byte operand of a `newarray` instruction to a descriptor.
    pub fn from_newarray_operand(operand: u8) -> Result<Descriptor> {
        let base = match operand {
            4 => BaseType::Boolean,
            5 => BaseType::Char,
            6 => BaseType::Float,
            7 => BaseType::Double,
            8 => BaseType::Byte,
            9 => BaseType::Short,
            10 => BaseType::Int,
            11 => BaseType::Long,
            x => return Err(CorruptKind::BadNewArrayType(x).into()),
        };
        Ok(Descriptor {
            base,
            array_dimensions: 0,
        })
    }

    pub fn base(&self) -> &BaseType {
        &self.base
    }

    pub fn is_array(&self) -> bool {
        self.array_dimensions > 0
    }

    pub fn array_dimensions(&self) -> u8 {
        self.array_dimensions
    }

    /// The dotted class name for object descriptors, `None` otherwise.
    pub fn class_name(&self) -> Option<&str> {
        match &self.base {
            BaseType::Object(name) => Some(name),
            _ => None,
        }
    }

    pub fn formal_size(&self) -> u32 {
        self.base.formal_size()
    }
}

impl Display for Descriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.base {
            BaseType::Byte => write!(f, "byte")?,
            BaseType::Char => write!(f, "char")?,
            BaseType::Double => write!(f, "double")?,
            BaseType::Float => write!(f, "float")?,
            BaseType::Int => write!(f, "int")?,
            BaseType::Long => write!(f, "long")?,
            BaseType::Short => write!(f, "short")?,
            BaseType::Boolean => write!(f, "boolean")?,
            BaseType::Void => write!(f, "void")?,
            BaseType::Object(name) => write!(f, "{}", name)?,
        }
        for _ in 0..self.array_dimensions {
            write!(f, "[]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    parameters: Vec<Descriptor>,
    return_type: Descriptor,
    formal_param_size: u32,
}

impl MethodDescriptor {
    /// Parses a method descriptor, `(` parameters `)` return-type.
    pub fn parse(s: &str) -> Result<MethodDescriptor> {
        let chars = &mut Chars::new(s);
        if chars.next() != Some(b'(') {
            return Err(CorruptKind::BadDescriptor.into());
        }

        let mut parameters = Vec::new();
        let mut formal_param_size = 0;
        loop {
            match chars.peek() {
                Some(b')') => {
                    chars.bump();
                    break;
                }
                Some(_) => {
                    let param = Descriptor::read(chars)?;
                    formal_param_size += param.formal_size();
                    parameters.push(param);
                }
                None => return Err(CorruptKind::BadDescriptor.into()),
            }
        }

        let return_type = Descriptor::read(chars)?;
        Ok(MethodDescriptor {
            parameters,
            return_type,
            formal_param_size,
        })
    }

    pub fn parameters(&self) -> &[Descriptor] {
        &self.parameters
    }

    pub fn return_type(&self) -> &Descriptor {
        &self.return_type
    }

    /// Sum of the formal sizes of all parameters.
    pub fn formal_param_size(&self) -> u32 {
        self.formal_param_size
    }
}

impl Display for MethodDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, param) in self.parameters.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param)?;
        }
        write!(f, ") -> {}", self.return_type)
    }
}

/// Byte cursor over a descriptor string.
struct Chars<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> Chars<'a> {
    fn new(s: &'a str) -> Self {
        Chars { s, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.s.as_bytes().get(self.pos).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn next(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    /// Consumes up to the closing `;`, rewriting `/` to `.`.
    fn class_name(&mut self) -> Result<String> {
        let start = self.pos;
        loop {
            match self.peek() {
                Some(b';') => break,
                Some(_) => self.bump(),
                None => return Err(CorruptKind::BadDescriptor.into()),
            }
        }

        let name = self.s[start..self.pos].replace('/', ".");
        self.bump();
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::{CorruptKind, Error};

    fn corruption(err: Error) -> CorruptKind {
        match err {
            Error::Corrupt(kind) => kind,
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn primitive_field() {
        let desc = Descriptor::parse("I").unwrap();
        assert_eq!(*desc.base(), BaseType::Int);
        assert_eq!(desc.array_dimensions(), 0);
        assert_eq!(desc.formal_size(), 1);
    }

    #[test]
    fn object_field_rewrites_slashes() {
        let desc = Descriptor::parse("Ljava/lang/String;").unwrap();
        assert_eq!(desc.class_name(), Some("java.lang.String"));
        assert_eq!(desc.to_string(), "java.lang.String");
    }

    #[test]
    fn array_dimensions_counted() {
        let desc = Descriptor::parse("[[J").unwrap();
        assert_eq!(*desc.base(), BaseType::Long);
        assert_eq!(desc.array_dimensions(), 2);
        assert_eq!(desc.to_string(), "long[][]");
        // Formal size follows the base type.
        assert_eq!(desc.formal_size(), 2);
    }

    #[test]
    fn void_array_rejected() {
        assert_eq!(
            corruption(Descriptor::parse("[V").unwrap_err()),
            CorruptKind::BadDescriptor
        );
    }

    #[test]
    fn truncated_object_rejected() {
        assert_eq!(
            corruption(Descriptor::parse("Ljava/lang/String").unwrap_err()),
            CorruptKind::BadDescriptor
        );
        assert_eq!(
            corruption(Descriptor::parse("[").unwrap_err()),
            CorruptKind::BadDescriptor
        );
        assert_eq!(
            corruption(Descriptor::parse("Q").unwrap_err()),
            CorruptKind::BadDescriptor
        );
    }

    #[test]
    fn method_descriptor_params_and_size() {
        let desc = MethodDescriptor::parse("(IJLjava/lang/Object;[D)V").unwrap();
        assert_eq!(desc.parameters().len(), 4);
        // int(1) + long(2) + reference(1) + double[](2, by base type)
        assert_eq!(desc.formal_param_size(), 6);
        assert_eq!(*desc.return_type().base(), BaseType::Void);
    }

    #[test]
    fn main_signature() {
        let desc = MethodDescriptor::parse("([Ljava/lang/String;)V").unwrap();
        let param = &desc.parameters()[0];
        assert_eq!(param.class_name(), Some("java.lang.String"));
        assert_eq!(param.array_dimensions(), 1);
        assert_eq!(desc.to_string(), "(java.lang.String[]) -> void");
    }

    #[test]
    fn method_descriptor_requires_parens() {
        assert_eq!(
            corruption(MethodDescriptor::parse("IJ)V").unwrap_err()),
            CorruptKind::BadDescriptor
        );
        assert_eq!(
            corruption(MethodDescriptor::parse("(IJ").unwrap_err()),
            CorruptKind::BadDescriptor
        );
    }

    #[test]
    fn rendering_is_stable_across_parses() {
        for raw in ["(IJ[Ljava/util/List;)Ljava/lang/String;", "()V", "([[B)I"] {
            let first = MethodDescriptor::parse(raw).unwrap().to_string();
            let second = MethodDescriptor::parse(raw).unwrap().to_string();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn newarray_operands() {
        assert_eq!(
            *Descriptor::from_newarray_operand(10).unwrap().base(),
            BaseType::Int
        );
        assert_eq!(
            *Descriptor::from_newarray_operand(4).unwrap().base(),
            BaseType::Boolean
        );
        assert_eq!(
            corruption(Descriptor::from_newarray_operand(12).unwrap_err()),
            CorruptKind::BadNewArrayType(12)
        );
    }
}
