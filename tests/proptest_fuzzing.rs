//! Property-Based Testing for provplan
//!
//! Uses proptest to fuzz-test determinism and parsing:
//! - Resource token (token.rs)
//! - Reference scanning and predicates (binding/)
//! - Graph ordering (dag/graph.rs)

use proptest::prelude::*;

// =============================================================================
// TEST 1: Resource Token
// =============================================================================

mod token_props {
    use super::*;
    use provplan::token::{generate_token, TOKEN_LEN};

    prop_compose! {
        fn arb_triple()(
            scope in r"[a-z0-9-]{1,36}",
            env in r"[a-zA-Z0-9-]{1,64}",
            region in r"[a-z0-9]{1,20}"
        ) -> (String, String, String) {
            (scope, env, region)
        }
    }

    proptest! {
        /// Property: equal triples give identical tokens
        #[test]
        fn test_equal_triples_equal_tokens((scope, env, region) in arb_triple()) {
            prop_assert_eq!(
                generate_token(&scope, &env, &region),
                generate_token(&scope, &env, &region)
            );
        }

        /// Property: differing triples give different tokens
        #[test]
        fn test_differing_triples_differ(a in arb_triple(), b in arb_triple()) {
            let fold = |t: &(String, String, String)| {
                (t.0.to_lowercase(), t.1.to_lowercase(), t.2.to_lowercase())
            };
            prop_assume!(fold(&a) != fold(&b));
            prop_assert_ne!(
                generate_token(&a.0, &a.1, &a.2),
                generate_token(&b.0, &b.1, &b.2)
            );
        }

        /// Property: shape is fixed length lower-case base32
        #[test]
        fn test_token_shape(scope in ".*", env in ".*", region in ".*") {
            let token = generate_token(&scope, &env, &region);
            prop_assert_eq!(token.as_str().len(), TOKEN_LEN);
            prop_assert!(token
                .as_str()
                .chars()
                .all(|c| c.is_ascii_lowercase() || ('2'..='7').contains(&c)));
        }

        /// Property: case does not matter
        #[test]
        fn test_token_case_insensitive((scope, env, region) in arb_triple()) {
            prop_assert_eq!(
                generate_token(&scope, &env, &region),
                generate_token(&scope.to_uppercase(), &env.to_uppercase(), &region.to_uppercase())
            );
        }

        /// Property: moving characters between components changes the token
        #[test]
        fn test_component_boundaries_matter(env in r"[a-z]{2,10}", region in r"[a-z]{1,10}") {
            let (head, tail) = env.split_at(1);
            prop_assert_ne!(
                generate_token("s", &env, &region),
                generate_token("s", head, &format!("{}{}", tail, region))
            );
        }
    }
}

// =============================================================================
// TEST 2: Reference Scanning & Predicates
// =============================================================================

mod binding_fuzzing {
    use super::*;
    use provplan::binding::{scan_str, Predicate, Reference};

    proptest! {
        /// Property: scanning never panics
        #[test]
        fn test_scan_never_panics(expression in ".*") {
            let _ = scan_str(&expression);
        }

        /// Property: text without braces has no references
        #[test]
        fn test_plain_text_has_no_refs(s in "[^{}]*") {
            prop_assert!(scan_str(&s).unwrap().is_empty());
        }

        /// Property: a well-formed output reference is found with its parts
        #[test]
        fn test_output_reference_found(
            prefix in "[a-z -]{0,10}",
            node in r"[a-z][a-zA-Z0-9]{0,15}",
            key in r"[a-z][a-zA-Z0-9]{0,15}",
            suffix in "[a-z -]{0,10}"
        ) {
            prop_assume!(node != "token" && node != "param");
            let expression = format!("{}{{{{ {}.outputs.{} }}}}{}", prefix, node, key, suffix);
            let refs = scan_str(&expression).unwrap();
            prop_assert_eq!(refs.len(), 1);
            prop_assert_eq!(&refs[0], &Reference::Output { node, key });
        }

        /// Property: predicate parsing never panics
        #[test]
        fn test_predicate_parse_never_panics(source in ".*") {
            let _ = Predicate::parse(&source);
        }
    }
}

// =============================================================================
// TEST 3: Graph Ordering
// =============================================================================

mod graph_props {
    use super::*;
    use provplan::ModuleGraph;
    use std::sync::Arc;

    prop_compose! {
        /// Random DAG: edges only go from a lower to a higher index
        fn arb_dag()(n in 1usize..20)(
            n in Just(n),
            raw in prop::collection::vec((0usize..20, 0usize..20), 0..40)
        ) -> (Vec<Arc<str>>, Vec<(Arc<str>, Arc<str>)>) {
            let names: Vec<Arc<str>> = (0..n).map(|i| Arc::from(format!("n{}", i))).collect();
            let edges = raw
                .into_iter()
                .map(|(a, b)| (a % n, b % n))
                .filter(|(a, b)| a < b)
                .map(|(a, b)| (Arc::clone(&names[a]), Arc::clone(&names[b])))
                .collect();
            (names, edges)
        }
    }

    proptest! {
        /// Property: every node comes after all of its dependencies
        #[test]
        fn test_order_respects_edges((names, edges) in arb_dag()) {
            let graph = ModuleGraph::new(&names, &edges);
            let order = graph.topological_order().unwrap();
            prop_assert_eq!(order.len(), names.len());

            let pos = |n: &str| order.iter().position(|o| o.as_ref() == n).unwrap();
            for (dep, node) in &edges {
                prop_assert!(pos(dep) < pos(node));
            }
        }

        /// Property: waves partition the order and never hold an edge
        #[test]
        fn test_waves_partition((names, edges) in arb_dag()) {
            let graph = ModuleGraph::new(&names, &edges);
            let waves = graph.waves().unwrap();
            let total: usize = waves.iter().map(Vec::len).sum();
            prop_assert_eq!(total, names.len());

            let wave_of = |n: &str| waves.iter().position(|w| w.iter().any(|x| x.as_ref() == n)).unwrap();
            for (dep, node) in &edges {
                prop_assert!(wave_of(dep) < wave_of(node));
            }
        }

        /// Property: adding a back edge along a path makes the graph cyclic
        #[test]
        fn test_back_edge_is_cycle((names, mut edges) in arb_dag()) {
            prop_assume!(!edges.is_empty());
            let (from, to) = edges[0].clone();
            edges.push((to, from));
            let graph = ModuleGraph::new(&names, &edges);
            prop_assert!(graph.topological_order().is_err());
        }
    }
}
