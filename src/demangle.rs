//! MSVC type-name decoding for RTTI type descriptors.
//!
//! `type_info` records store decorated names such as `.?AVCEntity@client@@`.
//! Only the "type only" subset of the MSVC grammar is needed to turn those into
//! `class client::CEntity`: class/struct/union/enum names with namespaces,
//! name back-references, template instantiations, primitive types, pointers
//! and references. Anything outside that subset fails to decode, which the RTTI
//! validator treats as "not a type descriptor".

const MAX_BACKREFS: usize = 10;
const MAX_DEPTH: usize = 32;

/// Decode a type descriptor name with its leading `.` already removed.
///
/// ```
/// use vmtsig::demangle::demangle_type;
///
/// assert_eq!(demangle_type("?AVFoo@@").as_deref(), Some("class Foo"));
/// assert_eq!(demangle_type("?AUBar@ns@@").as_deref(), Some("struct ns::Bar"));
/// assert_eq!(demangle_type("?AVFoo"), None);
/// ```
pub fn demangle_type(mangled: &str) -> Option<String> {
    let mut parser = Parser::new(mangled.as_bytes());

    // Class-like descriptors carry a "?<cv>" data-type prefix
    let decoded = if parser.consume(b'?') {
        parser.parse_cv()?;
        parser.parse_type()?
    } else {
        parser.parse_type()?
    };

    parser.at_end().then_some(decoded)
}

/// Strip the leading `class `/`struct `/... keyword from a decoded name.
pub fn strip_type_keyword(decoded: &str) -> &str {
    decoded
        .split_once(' ')
        .map(|(_, rest)| rest)
        .unwrap_or(decoded)
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    depth: usize,
    /// Name back-reference table (`0`-`9` in name position).
    names: Vec<String>,
    /// Type back-reference table (`0`-`9` in template argument position).
    types: Vec<String>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            depth: 0,
            names: Vec::new(),
            types: Vec::new(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.input.get(self.pos + ahead).copied()
    }

    fn next(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn consume(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn consume_str(&mut self, s: &[u8]) -> bool {
        if self.input[self.pos..].starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn at_end(&self) -> bool {
        self.pos == self.input.len()
    }

    fn memorize_name(&mut self, name: &str) {
        if self.names.len() < MAX_BACKREFS && !self.names.iter().any(|n| n == name) {
            self.names.push(name.to_string());
        }
    }

    /// `A` none, `B` const, `C` volatile, `D` const volatile.
    fn parse_cv(&mut self) -> Option<&'static str> {
        match self.next()? {
            b'A' => Some(""),
            b'B' => Some("const"),
            b'C' => Some("volatile"),
            b'D' => Some("const volatile"),
            _ => None,
        }
    }

    fn parse_type(&mut self) -> Option<String> {
        if self.depth >= MAX_DEPTH {
            return None;
        }
        self.depth += 1;
        let ty = self.parse_type_inner();
        self.depth -= 1;
        ty
    }

    fn parse_type_inner(&mut self) -> Option<String> {
        let code = self.next()?;
        let ty = match code {
            b'V' => format!("class {}", self.parse_qualified_name()?),
            b'U' => format!("struct {}", self.parse_qualified_name()?),
            b'T' => format!("union {}", self.parse_qualified_name()?),
            b'W' => {
                // Underlying type digit, always 4 (int) in practice
                match self.next()? {
                    b'0'..=b'7' => format!("enum {}", self.parse_qualified_name()?),
                    _ => return None,
                }
            }
            b'C' => "signed char".into(),
            b'D' => "char".into(),
            b'E' => "unsigned char".into(),
            b'F' => "short".into(),
            b'G' => "unsigned short".into(),
            b'H' => "int".into(),
            b'I' => "unsigned int".into(),
            b'J' => "long".into(),
            b'K' => "unsigned long".into(),
            b'M' => "float".into(),
            b'N' => "double".into(),
            b'O' => "long double".into(),
            b'X' => "void".into(),
            b'_' => self.parse_extended_type()?.into(),
            b'P' | b'Q' | b'R' | b'S' => self.parse_pointer("*")?,
            b'A' | b'B' => self.parse_pointer("&")?,
            b'$' => {
                if self.consume_str(b"$Q") {
                    self.parse_pointer("&&")?
                } else if self.consume_str(b"$T") {
                    "std::nullptr_t".into()
                } else {
                    return None;
                }
            }
            b'0'..=b'9' => self.types.get((code - b'0') as usize)?.clone(),
            _ => return None,
        };
        Some(ty)
    }

    fn parse_extended_type(&mut self) -> Option<&'static str> {
        let ty = match self.next()? {
            b'D' => "__int8",
            b'E' => "unsigned __int8",
            b'F' => "__int16",
            b'G' => "unsigned __int16",
            b'H' => "__int32",
            b'I' => "unsigned __int32",
            b'J' => "__int64",
            b'K' => "unsigned __int64",
            b'N' => "bool",
            b'Q' => "char8_t",
            b'S' => "char16_t",
            b'U' => "char32_t",
            b'W' => "wchar_t",
            _ => return None,
        };
        Some(ty)
    }

    /// Pointer or reference: `[E][I][F]<cv><pointee>`.
    fn parse_pointer(&mut self, op: &str) -> Option<String> {
        // __ptr64, __restrict, __unaligned
        while matches!(self.peek(), Some(b'E' | b'I' | b'F')) {
            self.pos += 1;
        }

        // Function and member pointers are not part of type descriptor names
        if matches!(self.peek(), Some(b'6' | b'8')) {
            return None;
        }

        let cv = self.parse_cv()?;
        let pointee = self.parse_type()?;
        Some(if cv.is_empty() {
            format!("{pointee} {op}")
        } else {
            format!("{pointee} {cv} {op}")
        })
    }

    /// `fragment* @`, innermost name first; rendered outermost first.
    fn parse_qualified_name(&mut self) -> Option<String> {
        let mut fragments = Vec::new();

        loop {
            match self.peek()? {
                b'@' => {
                    self.pos += 1;
                    break;
                }
                d @ b'0'..=b'9' => {
                    self.pos += 1;
                    fragments.push(self.names.get((d - b'0') as usize)?.clone());
                }
                b'?' => match self.peek_at(1)? {
                    b'$' => {
                        self.pos += 2;
                        let name = self.parse_template_name()?;
                        self.memorize_name(&name);
                        fragments.push(name);
                    }
                    b'A' => {
                        // ?A0x<hash>@
                        self.pos += 2;
                        self.parse_simple_name()?;
                        fragments.push("`anonymous namespace'".to_string());
                    }
                    _ => return None,
                },
                _ => {
                    let name = self.parse_simple_name()?;
                    self.memorize_name(&name);
                    fragments.push(name);
                }
            }
        }

        if fragments.is_empty() {
            return None;
        }

        fragments.reverse();
        Some(fragments.join("::"))
    }

    /// Identifier characters up to and including the terminating `@`.
    fn parse_simple_name(&mut self) -> Option<String> {
        let rest = &self.input[self.pos..];
        let len = rest.iter().position(|&b| b == b'@')?;
        let name = &rest[..len];

        if name.is_empty()
            || !name
                .iter()
                .all(|&b| b.is_ascii_alphanumeric() || b == b'_' || b == b'$')
        {
            return None;
        }

        self.pos += len + 1;
        // Validated ASCII above
        Some(String::from_utf8_lossy(name).into_owned())
    }

    /// `?$` already consumed: `name@ args @`.
    ///
    /// Template arguments get their own back-reference tables.
    fn parse_template_name(&mut self) -> Option<String> {
        let outer_names = std::mem::take(&mut self.names);
        let outer_types = std::mem::take(&mut self.types);

        let result = self.parse_simple_name().and_then(|name| {
            self.memorize_name(&name);
            let args = self.parse_template_args()?;
            Some(if args.ends_with('>') {
                format!("{name}<{args} >")
            } else {
                format!("{name}<{args}>")
            })
        });

        self.names = outer_names;
        self.types = outer_types;
        result
    }

    fn parse_template_args(&mut self) -> Option<String> {
        let mut args = Vec::new();

        loop {
            if self.consume(b'@') {
                break;
            }

            if self.consume_str(b"$0") {
                args.push(self.parse_number()?.to_string());
            } else if self.consume_str(b"$$V") || self.consume_str(b"$$Z") {
                // Empty parameter pack
            } else {
                let start = self.pos;
                let ty = self.parse_type()?;
                if self.pos - start > 1 && self.types.len() < MAX_BACKREFS {
                    self.types.push(ty.clone());
                }
                args.push(ty);
            }
        }

        Some(args.join(","))
    }

    /// `?`-negated; a digit encodes 1-10, otherwise hex nibbles `A`-`P` ending in `@`.
    fn parse_number(&mut self) -> Option<i64> {
        let negative = self.consume(b'?');

        let value = match self.next()? {
            d @ b'0'..=b'9' => (d - b'0') as i64 + 1,
            first @ b'A'..=b'P' => {
                let mut value = (first - b'A') as i64;
                loop {
                    match self.next()? {
                        b'@' => break,
                        n @ b'A'..=b'P' => {
                            value = value.checked_mul(16)?.checked_add((n - b'A') as i64)?;
                        }
                        _ => return None,
                    }
                }
                value
            }
            _ => return None,
        };

        Some(if negative { -value } else { value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(s: &str) -> Option<String> {
        demangle_type(s)
    }

    #[test]
    fn test_class_and_struct() {
        assert_eq!(decode("?AVFoo@@").as_deref(), Some("class Foo"));
        assert_eq!(decode("?AUBar@@").as_deref(), Some("struct Bar"));
        assert_eq!(decode("?ATValue@@").as_deref(), Some("union Value"));
        assert_eq!(decode("?AW4Color@@").as_deref(), Some("enum Color"));
    }

    #[test]
    fn test_namespaces() {
        assert_eq!(
            decode("?AVCEntity@client@@").as_deref(),
            Some("class client::CEntity")
        );
        assert_eq!(
            decode("?AVImpl@?A0x1b2c3d4e@@").as_deref(),
            Some("class `anonymous namespace'::Impl")
        );
    }

    #[test]
    fn test_templates() {
        assert_eq!(
            decode("?AV?$CUtlVector@H@@").as_deref(),
            Some("class CUtlVector<int>")
        );
        assert_eq!(
            decode("?AV?$Foo@V?$Bar@H@@@@").as_deref(),
            Some("class Foo<class Bar<int> >")
        );
        assert_eq!(
            decode("?AV?$Array@H$0BA@@@").as_deref(),
            Some("class Array<int,16>")
        );
        assert_eq!(
            decode("?AV?$Offset@$0?0@@").as_deref(),
            Some("class Offset<-1>")
        );
        assert_eq!(
            decode("?AV?$Holder@PEAVThing@@@@").as_deref(),
            Some("class Holder<class Thing *>")
        );
        assert_eq!(
            decode("?AV?$Tuple@$$V@std@@").as_deref(),
            Some("class std::Tuple<>")
        );
    }

    #[test]
    fn test_back_references() {
        assert_eq!(
            decode("?AV?$Pair@VA@ns@@VB@2@@@").as_deref(),
            Some("class Pair<class ns::A,class ns::B>")
        );
        // Type back-reference: second argument repeats the first
        assert_eq!(
            decode("?AV?$Pair@VWidget@@0@@").as_deref(),
            Some("class Pair<class Widget,class Widget>")
        );
        // Name back-reference into the outer scope
        assert_eq!(
            decode("?AVInner@Outer@1@@").as_deref(),
            Some("class Outer::Outer::Inner")
        );
    }

    #[test]
    fn test_primitive_types() {
        assert_eq!(decode("H").as_deref(), Some("int"));
        assert_eq!(decode("_N").as_deref(), Some("bool"));
        assert_eq!(decode("PEBD").as_deref(), Some("char const *"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(decode(""), None);
        assert_eq!(decode("?AVFoo"), None);
        assert_eq!(decode("?AV@@"), None);
        assert_eq!(decode("?AVFoo@@X"), None);
        assert_eq!(decode("?AZFoo@@"), None);
        assert_eq!(decode("?AVF o@@"), None);
        assert_eq!(decode("?AV5@@"), None);
        assert_eq!(decode("\u{ff}\u{fe}"), None);
    }

    #[test]
    fn test_depth_is_bounded() {
        let nested = format!("?A{}H", "PEA".repeat(200));
        assert_eq!(decode(&nested), None);
    }

    #[test]
    fn test_strip_type_keyword() {
        assert_eq!(strip_type_keyword("class Foo"), "Foo");
        assert_eq!(strip_type_keyword("struct ns::Bar"), "ns::Bar");
        assert_eq!(
            strip_type_keyword("class Foo<class Bar<int> >"),
            "Foo<class Bar<int> >"
        );
        assert_eq!(strip_type_keyword("int"), "int");
    }
}
