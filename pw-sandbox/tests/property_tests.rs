use proptest::prelude::*;
use pw_sandbox::template::{expand, placeholders};
use pw_sandbox::{get_env, set_env, Envs, Variable};

/// Variables `k0..kN` where `k{i}` may only reference `k{j}` with `j > i`,
/// so there are no cycles and chains stay shorter than the pass limit.
fn acyclic_vars() -> impl Strategy<Value = Vec<Variable>> {
    prop::collection::vec(("[a-z ]{0,6}", prop::option::of(0usize..6), "[a-z ]{0,6}"), 1..6).prop_map(
        |parts| {
            let n = parts.len();
            parts
                .into_iter()
                .enumerate()
                .map(|(i, (pre, target, post))| {
                    let reference = match target {
                        Some(j) if i + 1 + j < n => format!("<<k{}>>", i + 1 + j),
                        Some(_) => "<<unknown>>".to_owned(),
                        None => String::new(),
                    };
                    Variable::new(format!("k{i}"), format!("{pre}{reference}{post}"))
                })
                .collect()
        },
    )
}

/// Text mixing literals with references to `k0..k7` (some of which may not exist).
fn template_text() -> impl Strategy<Value = String> {
    prop::collection::vec(("[a-z ]{0,4}", 0usize..8), 0..6)
        .prop_map(|parts| parts.into_iter().map(|(t, k)| format!("{t}<<k{k}>>")).collect())
}

fn variables() -> impl Strategy<Value = Vec<Variable>> {
    prop::collection::vec(("[a-c]", "[a-z]{0,3}"), 0..5)
        .prop_map(|kv| kv.into_iter().map(|(k, v)| Variable::new(k, v)).collect())
}

proptest! {
    /// Expanding already-expanded text changes nothing when references are acyclic.
    #[test]
    fn expansion_is_idempotent_without_cycles(vars in acyclic_vars(), text in template_text()) {
        let once = expand(&text, &vars).expect("acyclic references never loop");
        let twice = expand(&once, &vars).expect("acyclic references never loop");
        prop_assert_eq!(&once, &twice);
        // Whatever remains names no defined variable.
        for name in placeholders(&once) {
            prop_assert!(vars.iter().all(|v| v.key != name), "left {} unresolved", name);
        }
    }

    /// Text without markers is returned unchanged.
    #[test]
    fn plain_text_unchanged(text in "[^<>]*", vars in acyclic_vars()) {
        prop_assert_eq!(expand(&text, &vars), Ok(text));
    }

    /// The selected tier always wins a lookup.
    #[test]
    fn selected_precedence(key in "[a-z]{1,4}", s in "[a-z]{0,4}", g in "[a-z]{0,4}") {
        let envs = Envs::new(vec![Variable::new(&key, &g)], vec![Variable::new(&key, &s)]);
        prop_assert_eq!(get_env(&key, &envs).map(|v| v.value.clone()), Some(s));
    }

    /// set_env writes only to selected and the new value is what lookups see.
    #[test]
    fn set_env_writes_selected_only(
        global in variables(),
        selected in variables(),
        key in "[a-d]",
        value in "[a-z]{0,4}",
    ) {
        let envs = Envs::new(global, selected);
        let next = set_env(&key, &value, &envs);
        prop_assert_eq!(&next.global, &envs.global);
        prop_assert_eq!(get_env(&key, &next).map(|v| v.value.as_str()), Some(value.as_str()));
        let grew = next.selected.len() - envs.selected.len();
        let existed = envs.selected.iter().any(|v| v.key == key);
        prop_assert_eq!(grew, usize::from(!existed));
    }
}
