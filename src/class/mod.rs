use std::fmt::{self, Display, Formatter};

pub mod attribute;
pub mod class_file;
pub mod constant;
pub mod version;

use constant::ConstantPool;

/// Rendering for types whose text depends on the constant pool.
///
/// Mirrors `Display`, but threads the pool through so entries can resolve
/// names and descriptors. `display` adapts an implementor to `Display` for
/// use with `format!`, and `tabbed_fmt` re-indents nested renderings.
pub trait PoolDisplay {
    fn fmt(&self, f: &mut Formatter<'_>, pool: &ConstantPool) -> fmt::Result;

    fn tabbed_fmt(&self, f: &mut Formatter<'_>, pool: &ConstantPool, tabs: usize) -> fmt::Result
    where
        Self: Sized,
    {
        let out = format!("{}", self.display(pool));
        let offset = "  ".repeat(tabs);
        write!(f, "{}{}", &offset, out.replace('\n', &format!("\n{}", offset)))
    }

    fn display<'a>(&'a self, pool: &'a ConstantPool) -> WithPool<'a, Self>
    where
        Self: Sized,
    {
        WithPool(self, pool)
    }
}

pub struct WithPool<'a, T: ?Sized>(&'a T, &'a ConstantPool);

impl<'a, T: PoolDisplay> Display for WithPool<'a, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f, self.1)
    }
}
