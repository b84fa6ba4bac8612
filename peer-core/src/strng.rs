//! Cheaply clonable, immutable strings. Country codes, ASNs, and device ids
//! are copied onto every connection record, so reference counting beats
//! `String` here.

use arcstr::ArcStr;

pub type Strng = ArcStr;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	ArcStr::from(s.as_ref())
}

pub use arcstr::format;
pub use arcstr::literal;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn interning() {
		let a = new("us");
		let b = a.clone();
		assert_eq!(a, b);
		assert_eq!(a, literal!("us"));
	}
}
