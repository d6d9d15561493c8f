use chunkwise_sandbox::ast::{ExprKind, Node};
use chunkwise_sandbox::{guard, IsolationMode, Sandbox, SandboxConfig, SandboxError, Scope};
use proptest::prelude::*;

fn in_process() -> Sandbox {
    let config = SandboxConfig {
        isolation: IsolationMode::InProcess,
        require_resource_limits: false,
        eval_timeout_ms: 2_000,
        ..SandboxConfig::default()
    };
    Sandbox::new(config, None).unwrap()
}

async fn eval(source: &str) -> Result<serde_json::Value, SandboxError> {
    in_process()
        .evaluate(source, &Scope::inline("### File: a.txt\nhello\n"))
        .await
        .map(|outcome| outcome.value)
}

#[tokio::test]
async fn capability_escapes_are_rejected() {
    let attempts = [
        "__import__('os').system('id')",
        "import os\nos.listdir('.')",
        "from subprocess import run",
        "open('/etc/passwd').read()",
        "eval('1 + 1')",
        "exec('x = 1')",
        "getattr(context, 'upper')()",
        "globals()",
        "os.environ",
        "().__class__.__bases__[0].__subclasses__()",
        "(lambda: 0).__globals__",
        "print.__self__",
        "type(1)",
    ];
    for source in attempts {
        let err = eval(source).await.unwrap_err();
        assert!(err.is_gate_rejection(), "{source:?} gave {err:?}");
    }
}

#[tokio::test]
async fn forbidden_statements_name_the_construct() {
    let err = eval("def f():\n    return 1\n").await.unwrap_err();
    assert!(matches!(err, SandboxError::ForbiddenNode { ref node, .. } if node == "def"), "{err:?}");

    let err = eval("x = 1\ntry:\n    x = 2\nexcept Exception:\n    pass\n").await.unwrap_err();
    assert!(matches!(err, SandboxError::ForbiddenNode { ref node, .. } if node == "try"), "{err:?}");
}

#[tokio::test]
async fn private_attributes_are_rejected_statically() {
    let err = eval("context._private").await.unwrap_err();
    assert!(matches!(err, SandboxError::ForbiddenAttribute { ref name, line: 1 } if name == "_private"));

    let err = eval("x = 1\ncontext.mro").await.unwrap_err();
    assert!(matches!(err, SandboxError::ForbiddenAttribute { ref name, line: 2 } if name == "mro"));
}

#[tokio::test]
async fn split_dunder_in_format_field_is_caught_at_run_time() {
    let err = eval("('{0.__cl' + 'ass__}').format(1)").await.unwrap_err();
    assert!(
        matches!(err, SandboxError::ForbiddenAttribute { ref name, .. } if name == "__class__"),
        "{err:?}"
    );
    let err = eval("t = '{0._' + '_class__}'\nt.format(1)").await.unwrap_err();
    assert!(
        matches!(err, SandboxError::ForbiddenAttribute { ref name, .. } if name == "__class__"),
        "{err:?}"
    );
}

#[tokio::test]
async fn unknown_names_do_not_reach_the_host() {
    let err = eval("__name__").await.unwrap_err();
    assert!(matches!(err, SandboxError::Runtime { .. }), "{err:?}");
    let err = eval("breakpoint").await.unwrap_err();
    assert!(matches!(err, SandboxError::Runtime { .. }), "{err:?}");
}

#[tokio::test]
async fn ordinary_programs_still_work() {
    let value = eval("words = context.split()\nsorted(w.upper() for w in words)[-1]")
        .await
        .unwrap();
    assert_eq!(value, serde_json::json!("HELLO"));
    let value = eval("[f['path'] for f in files]").await.unwrap();
    assert_eq!(value, serde_json::json!(["a.txt"]));
}

fn fragment() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec![
        "x", "y", "1", "'s'", ".", "_", "__", "class", "(", ")", "[", "]", "+", " ", "\n", ":", "=",
        "lambda", "for", "in", "if", "format", "{", "}", "0", "context", "files",
    ])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Whatever the gates accept never names an underscore attribute.
    #[test]
    fn accepted_programs_have_no_private_attributes(parts in prop::collection::vec(fragment(), 0..24)) {
        let source: String = parts.concat();
        if let Ok(program) = guard::vet(&source) {
            let mut private = false;
            let _ = program.walk(&mut |node: Node<'_>| {
                if let Node::Expr(expr) = node {
                    if let ExprKind::Attribute { attr, .. } = &expr.kind {
                        private |= attr.starts_with('_');
                    }
                }
                Ok::<(), ()>(())
            });
            prop_assert!(!private, "{source:?}");
        }
    }

    #[test]
    fn gates_never_panic_on_ascii(source in "[ -~\n]{0,60}") {
        let _ = guard::vet(&source);
    }

    #[test]
    fn banned_capabilities_are_found_anywhere(prefix in "[a-z0-9 +\n]{0,20}", suffix in "[a-z0-9 +\n]{0,20}") {
        let source = format!("{prefix}__import__{suffix}");
        let err = guard::check_source(&source).unwrap_err();
        prop_assert!(
            matches!(err, SandboxError::ForbiddenPattern { .. }),
            "{:?}", err
        );
    }
}
