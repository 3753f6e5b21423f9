//! `REALLOC_*`: grow (or shrink) a trace's register-backed output buffer
//! when a loop's target register changes length mid-trace (the `phi`
//! invariant that closes a loop lets its two arguments' shapes differ at
//! runtime; the code generator is expected to resize the target register
//! when that happens).
//!
//! Expressed here as ordinary `Vec` resizing rather than a raw
//! malloc/realloc pair: the trace-entry/exit boundary already owns these
//! buffers as Rust `Vec`s, so there is no foreign allocator to hand off to.

pub fn realloc_double(buf: &mut Vec<f64>, new_len: usize) {
    buf.resize(new_len, 0.0);
}

pub fn realloc_integer(buf: &mut Vec<i64>, new_len: usize) {
    buf.resize(new_len, 0);
}

pub fn realloc_logical(buf: &mut Vec<u8>, new_len: usize) {
    buf.resize(new_len, 0);
}

pub fn realloc_character(buf: &mut Vec<u32>, new_len: usize) {
    buf.resize(new_len, crate::cell::Tag::Null as u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growing_a_double_buffer_zero_fills_the_new_tail() {
        let mut buf = vec![1.0, 2.0];
        realloc_double(&mut buf, 4);
        assert_eq!(buf, vec![1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn shrinking_truncates() {
        let mut buf = vec![1i64, 2, 3];
        realloc_integer(&mut buf, 1);
        assert_eq!(buf, vec![1]);
    }
}
