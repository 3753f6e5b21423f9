//! Argument matching: exact name, then partial prefix, then positional,
//! with anything left over folded into `...`.

use crate::value::{Sym, Value};

/// One actual argument at a call site.
#[derive(Debug, Clone)]
pub struct Actual {
    pub name: Option<Sym>,
    pub value: Value,
}

/// Prefix matching needs the string behind a [`Sym`]; the interning table
/// itself is an external collaborator, so this crate only depends on the
/// narrow capability it needs.
pub trait NameResolver {
    fn is_prefix(&self, prefix: Sym, full: Sym) -> bool;
}

#[derive(Debug)]
pub struct MatchResult {
    /// One slot per formal parameter; `None` means "unfilled, use the
    /// parameter's default".
    pub bound: Vec<Option<Value>>,
    /// Leftover actuals, named or not, collected into `...` in the order
    /// they were encountered.
    pub dots: Vec<(Option<Sym>, Value)>,
}

/// `params[dots_index..]` does not exist as a real parameter to match
/// against; it is the sink.
pub fn match_arguments(
    params: &[Sym],
    dots_index: usize,
    actuals: &[Actual],
    resolver: &dyn NameResolver,
) -> MatchResult {
    let formal_count = dots_index.min(params.len());
    let mut bound: Vec<Option<Value>> = vec![None; formal_count];
    let mut consumed = vec![false; actuals.len()];

    // 1. Exact name match.
    for (i, actual) in actuals.iter().enumerate() {
        let Some(name) = actual.name else { continue };
        for (p, &pname) in params[..formal_count].iter().enumerate() {
            if bound[p].is_none() && pname == name {
                bound[p] = Some(actual.value.clone());
                consumed[i] = true;
                break;
            }
        }
    }

    // 2. Partial-prefix match among the actuals not yet consumed.
    for (i, actual) in actuals.iter().enumerate() {
        if consumed[i] {
            continue;
        }
        let Some(name) = actual.name else { continue };
        let mut candidates: Vec<usize> = Vec::new();
        for (p, &pname) in params[..formal_count].iter().enumerate() {
            if bound[p].is_none() && resolver.is_prefix(name, pname) {
                candidates.push(p);
            }
        }
        if candidates.len() == 1 {
            let p = candidates[0];
            bound[p] = Some(actual.value.clone());
            consumed[i] = true;
        }
    }

    // 3. Positional fill of unnamed actuals into still-unset parameters.
    let mut next_unset = 0usize;
    for (i, actual) in actuals.iter().enumerate() {
        if consumed[i] || actual.name.is_some() {
            continue;
        }
        while next_unset < formal_count && bound[next_unset].is_some() {
            next_unset += 1;
        }
        if next_unset >= formal_count {
            break;
        }
        bound[next_unset] = Some(actual.value.clone());
        consumed[i] = true;
        next_unset += 1;
    }

    // 4. Anything left over goes to `...`, names preserved.
    let mut dots = Vec::new();
    for (i, actual) in actuals.iter().enumerate() {
        if !consumed[i] {
            dots.push((actual.name, actual.value.clone()));
        }
    }

    MatchResult { bound, dots }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoPrefix;
    impl NameResolver for NoPrefix {
        fn is_prefix(&self, _prefix: Sym, _full: Sym) -> bool {
            false
        }
    }

    /// Symbol ids double as "string equality" in these tests via a tiny
    /// convention: prefix matches succeed iff prefix == full - 100.
    struct OffsetPrefix;
    impl NameResolver for OffsetPrefix {
        fn is_prefix(&self, prefix: Sym, full: Sym) -> bool {
            prefix + 100 == full
        }
    }

    fn named(name: Sym, v: i64) -> Actual {
        Actual {
            name: Some(name),
            value: Value::scalar_integer(v),
        }
    }

    fn positional(v: i64) -> Actual {
        Actual {
            name: None,
            value: Value::scalar_integer(v),
        }
    }

    // f(a, b=2, ...); f(b=3, 1, 4, 5) -> a=1, b=3, dots=[4,5]
    fn params_abc() -> (Vec<Sym>, usize) {
        (vec![1 /* a */, 2 /* b */], 2)
    }

    #[test]
    fn scenario_e_calling_convention() {
        let (params, dots_index) = params_abc();
        let actuals = vec![named(2, 3), positional(1), positional(4), positional(5)];
        let r = match_arguments(&params, dots_index, &actuals, &NoPrefix);
        let a = r.bound[0].as_ref().unwrap().as_integer_slice().unwrap()[0];
        let b = r.bound[1].as_ref().unwrap().as_integer_slice().unwrap()[0];
        assert_eq!(a, 1);
        assert_eq!(b, 3);
        assert_eq!(r.dots.len(), 2);
        assert_eq!(r.dots[0].1.as_integer_slice().unwrap()[0], 4);
        assert_eq!(r.dots[1].1.as_integer_slice().unwrap()[0], 5);
    }

    #[test]
    fn named_matching_is_order_insensitive() {
        let (params, dots_index) = params_abc();
        let forward = vec![named(1, 10), named(2, 20)];
        let backward = vec![named(2, 20), named(1, 10)];
        let r1 = match_arguments(&params, dots_index, &forward, &NoPrefix);
        let r2 = match_arguments(&params, dots_index, &backward, &NoPrefix);
        for i in 0..2 {
            let v1 = r1.bound[i].as_ref().unwrap().as_integer_slice().unwrap()[0];
            let v2 = r2.bound[i].as_ref().unwrap().as_integer_slice().unwrap()[0];
            assert_eq!(v1, v2);
        }
    }

    #[test]
    fn unique_partial_prefix_binds() {
        let params = vec![1 /* alpha */];
        let actuals = vec![named(1 - 0, 5)]; // exact, sanity check unaffected
        let r = match_arguments(&params, 1, &actuals, &OffsetPrefix);
        assert!(r.bound[0].is_some());

        // Now a genuine prefix case: param id 101, actual passes prefix id 1
        // which OffsetPrefix treats as a prefix of 101.
        let params2 = vec![101];
        let actuals2 = vec![named(1, 9)];
        let r2 = match_arguments(&params2, 1, &actuals2, &OffsetPrefix);
        assert_eq!(r2.bound[0].as_ref().unwrap().as_integer_slice().unwrap()[0], 9);
    }

    #[test]
    fn ambiguous_partial_prefix_falls_through_to_dots() {
        let params = vec![101, 102];
        let actuals = vec![named(1, 9)]; // prefix of both 101 and 102
        let r = match_arguments(&params, 2, &actuals, &OffsetPrefix);
        assert!(r.bound[0].is_none());
        assert!(r.bound[1].is_none());
        assert_eq!(r.dots.len(), 1);
    }

    #[test]
    fn positional_fill_stops_before_dots_index() {
        let params = vec![1, 2];
        let actuals = vec![positional(1), positional(2), positional(3)];
        let r = match_arguments(&params, 2, &actuals, &NoPrefix);
        assert_eq!(r.bound[0].as_ref().unwrap().as_integer_slice().unwrap()[0], 1);
        assert_eq!(r.bound[1].as_ref().unwrap().as_integer_slice().unwrap()[0], 2);
        assert_eq!(r.dots.len(), 1);
    }
}
