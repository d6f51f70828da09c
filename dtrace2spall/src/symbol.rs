//! Frame label cleanup.
//!
//! DTrace prints frames as `module`symbol+offset`. The offset changes with
//! every sampled instruction and C++ symbols carry their template and
//! argument lists, so both are stripped to give each function one identity.

use regex::Regex;
use std::sync::LazyLock;

/// Name used for frames that normalize to nothing.
pub const EMPTY_FRAME: &str = "-";

/// Trailing `+offset`, in hex or decimal. Other `+` signs belong to the name
/// (`libc++`, `operator+`) and are kept.
static OFFSET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\+(0[xX][0-9a-fA-F]+|[0-9]+)$").expect("Invalid offset regex pattern")
});

/// `scope::name` followed by an argument or template list.
static CPP_ARGUMENTS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(::[^(<]*)[(<].*").expect("Invalid C++ argument regex pattern")
});

/// Normalize a raw frame label into a canonical frame name.
///
/// ```
/// use dtrace2spall::symbol::normalize;
///
/// assert_eq!(normalize("libc.so`malloc+0x1a"), "libc.so`malloc");
/// assert_eq!(normalize("ns::Tmpl<int>(int)"), "ns::Tmpl");
/// assert_eq!(normalize(""), "-");
/// ```
pub fn normalize(raw: &str) -> String {
    let without_offset = OFFSET_RE.replace(raw, "");
    let name = CPP_ARGUMENTS_RE.replace(&without_offset, "$1");
    if name.is_empty() {
        EMPTY_FRAME.to_string()
    } else {
        name.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_offset() {
        assert_eq!(normalize("foo+0x1a"), "foo");
        assert_eq!(normalize("libsystem_c.dylib`malloc+0x1a"), "libsystem_c.dylib`malloc");
    }

    #[test]
    fn keeps_names_without_offset() {
        assert_eq!(normalize("myapp`main"), "myapp`main");
        assert_eq!(normalize("0xffffff8012345678"), "0xffffff8012345678");
    }

    #[test]
    fn strips_only_last_offset() {
        assert_eq!(normalize("a+b+0x10"), "a+b");
        assert_eq!(normalize("a+b+16"), "a+b");
    }

    #[test]
    fn keeps_plus_signs_in_names() {
        assert_eq!(normalize("a+b"), "a+b");
        assert_eq!(
            normalize("libc++.1.dylib`operator new(unsigned long)+0x1c"),
            "libc++.1.dylib`operator new(unsigned long)"
        );
        assert_eq!(
            normalize("libc++.1.dylib`std::__1::basic_string<char>::append(char const*)+0x50"),
            "libc++.1.dylib`std::__1::basic_string"
        );
    }

    #[test]
    fn collapses_cpp_templates_and_arguments() {
        assert_eq!(normalize("ns::Tmpl<int>(int)"), "ns::Tmpl");
        assert_eq!(
            normalize("libfoo.so`ns::Widget::draw(Canvas&, int) const+0x44"),
            "libfoo.so`ns::Widget::draw"
        );
        assert_eq!(normalize("std::vector<int>::push_back(int&&)"), "std::vector");
    }

    #[test]
    fn template_scope_before_qualifier_is_kept() {
        assert_eq!(normalize("Foo<int>::bar(int)"), "Foo<int>::bar");
    }

    #[test]
    fn plain_c_calls_are_not_collapsed() {
        assert_eq!(normalize("foo(int)"), "foo(int)");
    }

    #[test]
    fn empty_names_get_placeholder() {
        assert_eq!(normalize(""), EMPTY_FRAME);
        assert_eq!(normalize("+0x10"), EMPTY_FRAME);
    }

    #[test]
    fn normalizing_twice_is_stable() {
        for raw in [
            "foo+0x1a",
            "ns::Tmpl<int>(int)",
            "libfoo.so`ns::Widget::draw(Canvas&, int) const+0x44",
            "Foo<int>::bar(int)",
            "",
            "kernel`vm_fault_enter+0x123",
            "libc++.1.dylib`std::__1::basic_string<char>::append(char const*)+0x50",
            "libc++abi.dylib`__cxa_throw+0x8",
            "a+b+0x10",
        ] {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once, "normalizing {raw:?}");
        }
    }
}
