// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

use crate::*;
use serde_json::json;

fn engine() -> Engine<MemoryResolver> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Engine::with_memory_cache(MemoryResolver::new()).unwrap()
}

fn sam() -> serde_json::Value {
    json!({ "Name": "Sam" })
}

mod rendering {
    use super::*;

    #[test]
    fn end_to_end_scenario() {
        let engine = engine();
        let template =
            "Hello {{ Model.Name }}! {{% for i = 1, 2 do %}}{{ i }}. Hi {{% end %}}";
        let result = engine.execute_script(template, &sam()).unwrap();
        assert_eq!(result, "Hello Sam! 1. Hi 2. Hi ");
        assert!(!engine.has_error());
    }

    #[test]
    fn literal_only_render_is_idempotent_and_cached() {
        let engine = engine();
        let first = engine.execute_script("just text", &json!({})).unwrap();
        let second = engine.execute_script("just text", &json!({})).unwrap();
        assert_eq!(first, "just text");
        assert_eq!(first, second);
        assert_eq!(engine.compile_count(), 1);
    }

    #[test]
    fn local_function_declared_in_earlier_code_block() {
        let engine = engine();
        let template =
            "{{% local function shout(s) return s .. \"!\" end %}}{{ shout(Model.Name) }}";
        assert_eq!(engine.execute_script(template, &sam()).unwrap(), "Sam!");
    }

    #[test]
    fn code_blocks_can_use_the_writer() {
        let engine = engine();
        let result = engine
            .execute_script("a{{% script.write(\"b\") %}}c", &json!({}))
            .unwrap();
        assert_eq!(result, "abc");
    }

    #[test]
    fn multi_line_code_block_spans_segments() {
        let engine = engine();
        let template = "{{%\nlocal total = 0\nfor _, n in ipairs(Model.nums) do\ntotal = total + n\n%}}{{ n }} {{%\nend\n%}}= {{ total }}";
        let result = engine
            .execute_script(template, &json!({ "nums": [1, 2, 3] }))
            .unwrap();
        assert_eq!(result, "1 2 3 = 6");
    }

    #[test]
    fn comments_never_reach_the_output() {
        let engine = engine();
        let result = engine
            .execute_script("a{{@ not rendered {{ x }} @}}b", &json!({}))
            .unwrap();
        assert_eq!(result, "ab");
    }
}

mod encoding {
    use super::*;

    fn rick() -> serde_json::Value {
        json!({ "Name": "Rick & Dale" })
    }

    #[test]
    fn forced_encoding_escapes_html() {
        let engine = engine();
        let result = engine
            .execute_script("{{: Model.Name }}", &rick())
            .unwrap();
        assert_eq!(result, "Rick &amp; Dale");
    }

    #[test]
    fn forced_raw_is_verbatim() {
        let engine = engine();
        let result = engine
            .execute_script("{{! Model.Name }}", &rick())
            .unwrap();
        assert_eq!(result, "Rick & Dale");
    }

    #[test]
    fn default_policy_is_raw_unless_configured() {
        let engine = engine();
        let result = engine.execute_script("{{ Model.Name }}", &rick()).unwrap();
        assert_eq!(result, "Rick & Dale");
    }

    #[test]
    fn default_encode_on_flips_plain_but_not_raw() {
        let mut engine = engine();
        engine.set_default_html_encoding(true).unwrap();
        let result = engine
            .execute_script("{{ Model.Name }}|{{! Model.Name }}", &rick())
            .unwrap();
        assert_eq!(result, "Rick &amp; Dale|Rick & Dale");
    }

    #[test]
    fn raw_wrapped_values_are_never_escaped() {
        let engine = engine();
        let result = engine
            .execute_script("{{: script.raw(Model.Name) }}", &rick())
            .unwrap();
        assert_eq!(result, "Rick & Dale");
    }
}

mod layouts {
    use super::*;

    #[test]
    fn content_body_and_sections_splice_into_layout() {
        let engine = engine();
        engine.resolver().add_template(
            "_layout.html",
            "{{% script.render_section(\"setup\") %}}<title>{{ script.title }}</title><body>{{% script.content() %}}</body>",
        );
        let content = "{{% script.layout = \"/_layout.html\" %}}{{% script.section(\"setup\") %}}{{% script.title = \"X\" %}}{{% script.endsection() %}}BODY";
        let result = engine.execute_script(content, &json!({})).unwrap();
        assert_eq!(result, "<title>X</title><body>BODY</body>");
        assert_eq!(result.matches("BODY").count(), 1);
    }

    #[test]
    fn section_referenced_but_undeclared_renders_empty() {
        let engine = engine();
        engine.resolver().add_template(
            "_layout.html",
            "a{{% script.render_section(\"missing\") %}}b{{% script.content() %}}",
        );
        let content = "{{% script.layout = \"/_layout.html\" %}}c";
        let result = engine.execute_script(content, &json!({})).unwrap();
        assert_eq!(result, "abc");
        assert!(!engine.has_error());
    }

    #[test]
    fn section_declared_but_unreferenced_is_dropped() {
        let engine = engine();
        engine
            .resolver()
            .add_template("_layout.html", "[{{% script.content() %}}]");
        let content = "{{% script.layout = \"/_layout.html\" %}}{{% script.section(\"side\") %}}IGNORED{{% script.endsection() %}}kept";
        let result = engine.execute_script(content, &json!({})).unwrap();
        assert_eq!(result, "[kept]");
    }

    #[test]
    fn layouts_chain_until_a_root_is_reached() {
        let engine = engine();
        engine.resolver().add_template(
            "inner.html",
            "{{% script.layout = \"/outer.html\" %}}<i>{{% script.content() %}}</i>",
        );
        engine
            .resolver()
            .add_template("outer.html", "<o>{{% script.content() %}}</o>");
        let content = "{{% script.layout = \"/inner.html\" %}}x";
        let result = engine.execute_script(content, &json!({})).unwrap();
        assert_eq!(result, "<o><i>x</i></o>");
    }

    #[test]
    fn layout_cycle_is_reported_not_stack_overflowed() {
        let engine = engine();
        engine.resolver().add_template(
            "a.html",
            "{{% script.layout = \"/a.html\" %}}{{% script.content() %}}",
        );
        let content = "{{% script.layout = \"/a.html\" %}}x";
        let result = engine.execute_script(content, &json!({})).unwrap();
        assert_eq!(result, "");
        assert_eq!(engine.last_error().unwrap().kind, ErrorKind::Template);
    }

    #[test]
    fn missing_layout_is_a_resolution_error() {
        let engine = engine();
        let content = "{{% script.layout = \"/gone.html\" %}}x";
        let result = engine.execute_script(content, &json!({})).unwrap();
        assert_eq!(result, "");
        let state = engine.last_error().unwrap();
        assert_eq!(state.kind, ErrorKind::Resolution);
        assert!(state.message.contains("gone.html"));
    }
}

mod partials {
    use super::*;

    #[test]
    fn partial_renders_independently_and_splices_in_order() {
        let engine = engine();
        engine
            .resolver()
            .add_template("greet.html", "Hello {{ Model.Name }}");
        let template = "[{{% script.partial(\"/greet.html\", Model) %}}]";
        let result = engine.execute_script(template, &sam()).unwrap();
        assert_eq!(result, "[Hello Sam]");
    }

    #[test]
    fn partial_receives_the_supplied_model_expression() {
        let engine = engine();
        engine
            .resolver()
            .add_template("item.html", "<li>{{ Model }}</li>");
        let template =
            "{{% for _, item in ipairs(Model.items) do %}}{{% script.partial(\"/item.html\", item) %}}{{% end %}}";
        let result = engine
            .execute_script(template, &json!({ "items": ["a", "b"] }))
            .unwrap();
        assert_eq!(result, "<li>a</li><li>b</li>");
    }

    #[test]
    fn relative_partial_paths_resolve_from_the_including_file() {
        let engine = engine();
        engine.resolver().add_template(
            "pages/index.html",
            "{{% script.partial(\"../shared/greet.html\", Model) %}}",
        );
        engine
            .resolver()
            .add_template("shared/greet.html", "hi {{ Model.Name }}");
        let result = engine
            .execute_script_file("pages/index.html", &sam())
            .unwrap();
        assert_eq!(result, "hi Sam");
    }

    #[test]
    fn missing_partial_fails_the_whole_render() {
        let engine = engine();
        let template = "before{{% script.partial(\"/nope.html\") %}}after";
        let result = engine.execute_script(template, &json!({})).unwrap();
        assert_eq!(result, "");
        let state = engine.last_error().unwrap();
        assert_eq!(state.kind, ErrorKind::Resolution);
        assert!(state.message.contains("nope.html"));
    }

    #[test]
    fn throw_on_error_returns_the_captured_cause() {
        let mut engine = engine();
        engine.set_throw_on_error(true);
        let template = "{{% script.partial(\"/nope.html\") %}}";
        let err = engine.execute_script(template, &json!({})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution);
        assert!(engine.has_error());
    }

    #[test]
    fn partial_recursion_is_depth_limited() {
        let engine = engine();
        engine.resolver().add_template(
            "loop.html",
            "{{% script.partial(\"/loop.html\") %}}",
        );
        let result = engine
            .execute_script("{{% script.partial(\"/loop.html\") %}}", &json!({}))
            .unwrap();
        assert_eq!(result, "");
        assert_eq!(engine.last_error().unwrap().kind, ErrorKind::Template);
    }
}

mod snippets {
    use super::*;

    #[test]
    fn positional_parameters_resolve_distinctly() {
        let engine = engine();
        let args: Vec<serde_json::Value> =
            (0..11).map(|i| json!(format!("arg{}", i))).collect();
        let result = engine
            .execute_code("return @0 .. \"|\" .. @10", &args)
            .unwrap();
        assert_eq!(result, json!("arg0|arg10"));
    }

    #[test]
    fn snippet_results_convert_back_to_json() {
        let engine = engine();
        let result = engine
            .execute_code("return { total = @0 + @1 }", &[json!(2), json!(40)])
            .unwrap();
        assert_eq!(result, json!({ "total": 42 }));
    }

    #[test]
    fn identical_snippets_share_one_compilation() {
        let engine = engine();
        engine.execute_code("return @0", &[json!(1)]).unwrap();
        engine.execute_code("return @0", &[json!(2)]).unwrap();
        assert_eq!(engine.compile_count(), 1);
    }

    #[test]
    fn execute_method_invokes_by_runtime_name() {
        let engine = engine();
        let source = "local function add(a, b)\n  return a + b\nend";
        let result = engine.execute_method(source, "add", &[json!(2), json!(40)]).unwrap();
        assert_eq!(result, json!(42));
    }

    #[test]
    fn missing_method_is_reported() {
        let mut engine = engine();
        engine.set_throw_on_error(true);
        let source = "local function add(a, b)\n  return a + b\nend";
        let err = engine.execute_method(source, "sub", &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Template);
    }

    #[test]
    fn chunk_state_never_leaks_between_calls() {
        let engine = engine();
        let source = "local calls = 0\nlocal function bump()\n  calls = calls + 1\n  return calls\nend";
        let first = engine.execute_method(source, "bump", &[]).unwrap();
        let second = engine.execute_method(source, "bump", &[]).unwrap();
        assert_eq!(first, json!(1));
        assert_eq!(second, json!(1));
        assert_eq!(engine.compile_count(), 1);
    }

    #[test]
    fn snippet_runtime_errors_are_captured() {
        let engine = engine();
        let result = engine.execute_code("error(\"boom\")", &[]).unwrap();
        assert_eq!(result, serde_json::Value::Null);
        let state = engine.last_error().unwrap();
        assert_eq!(state.kind, ErrorKind::Runtime);
        assert!(state.message.contains("boom"));
    }
}

mod caching {
    use super::*;

    #[test]
    fn cosmetically_distinct_templates_share_an_entry() {
        let engine = engine();
        engine
            .execute_script("{{@ a comment @}}X", &json!({}))
            .unwrap();
        engine.execute_script("X", &json!({})).unwrap();
        assert_eq!(engine.compile_count(), 1);
        assert_eq!(engine.cache_len(), 1);
    }

    #[test]
    fn literal_whitespace_is_a_cache_dimension() {
        let engine = engine();
        engine.execute_script("X ", &json!({})).unwrap();
        engine.execute_script("X", &json!({})).unwrap();
        assert_eq!(engine.compile_count(), 2);
        assert_eq!(engine.cache_len(), 2);
    }

    #[test]
    fn compile_failures_are_not_cached() {
        let engine = engine();
        let template = "{{% this is not lua %}}";
        engine.execute_script(template, &json!({})).unwrap();
        assert_eq!(engine.last_error().unwrap().kind, ErrorKind::Compile);
        engine.execute_script(template, &json!({})).unwrap();
        assert_eq!(engine.compile_count(), 2);
        assert_eq!(engine.cache_len(), 0);
    }

    #[test]
    fn engines_can_share_a_cache() {
        let cache = MemoryCache::new();
        let a = Engine::new(MemoryResolver::new(), Box::new(cache.clone())).unwrap();
        let b = Engine::new(MemoryResolver::new(), Box::new(cache.clone())).unwrap();
        a.execute_script("shared", &json!({})).unwrap();
        b.execute_script("shared", &json!({})).unwrap();
        assert_eq!(a.compile_count(), 1);
        assert_eq!(b.compile_count(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[cfg(feature = "filesystem")]
    #[test]
    fn filesystem_cache_is_the_only_on_disk_artifact_path() {
        let dir = tempfile::tempdir().unwrap();
        let engine =
            Engine::with_filesystem_cache(MemoryResolver::new(), dir.path()).unwrap();
        engine.execute_script("persisted", &json!({})).unwrap();
        let count = std::fs::read_dir(dir.path()).unwrap().count();
        assert!(count >= 3, "expected source, chunk and metadata files");
    }
}

mod diagnostics {
    use super::*;

    #[test]
    fn unterminated_marker_is_a_parse_error() {
        let engine = engine();
        let result = engine.execute_script("ok {{ Model.Name", &sam()).unwrap();
        assert_eq!(result, "");
        let state = engine.last_error().unwrap();
        assert_eq!(state.kind, ErrorKind::Parse);
        assert!(state.message.contains("{{"));
        assert!(state.message.contains("offset 3"));
    }

    #[test]
    fn runtime_failures_are_captured_with_kind() {
        let engine = engine();
        let result = engine
            .execute_script("{{ Model.missing.deeper }}", &json!({}))
            .unwrap();
        assert_eq!(result, "");
        assert_eq!(engine.last_error().unwrap().kind, ErrorKind::Runtime);
    }

    #[test]
    fn error_state_clears_on_the_next_call() {
        let engine = engine();
        engine
            .execute_script("{{% script.partial(\"/nope.html\") %}}", &json!({}))
            .unwrap();
        assert!(engine.has_error());
        engine.execute_script("fine", &json!({})).unwrap();
        assert!(!engine.has_error());
    }

    #[test]
    fn parse_script_to_code_is_inspection_only() {
        let engine = engine();
        let source = engine.parse_script_to_code("Hello {{ Model.Name }}").unwrap();
        assert!(source.contains("__out[#__out + 1] = \"Hello \""));
        assert!(source.contains("__text(Model.Name)"));
        assert_eq!(engine.compile_count(), 0);
        assert_eq!(engine.generated_code().unwrap(), source);
    }

    #[test]
    fn generated_code_with_line_numbers_is_available() {
        let engine = engine();
        engine.execute_script("x", &json!({})).unwrap();
        let numbered = engine.generated_code_with_line_numbers().unwrap();
        assert!(numbered.starts_with("   1 | "));
    }

    #[test]
    fn compile_diagnostics_carry_line_numbers() {
        let mut engine = engine();
        engine.set_throw_on_error(true);
        let err = engine
            .execute_script("{{% this is not lua %}}", &json!({}))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Compile);
        assert!(err.to_string().contains("[line"));
    }
}

mod configuration {
    use super::*;

    #[test]
    fn custom_delimiters_render() {
        let mut engine = engine();
        engine
            .set_delimiters(DelimiterSet {
                expression_start: "<%=".into(),
                expression_end: "%>".into(),
                code_start: "<%".into(),
                code_end: "%>".into(),
                encoded_expression_start: "<%:".into(),
                raw_expression_start: "<%!".into(),
                comment_start: "<%--".into(),
                comment_end: "--%>".into(),
                html_encode_expressions_by_default: false,
            })
            .unwrap();
        let result = engine
            .execute_script("Hello <%= Model.Name %>!", &sam())
            .unwrap();
        assert_eq!(result, "Hello Sam!");
    }

    #[test]
    fn delimiters_freeze_after_first_parse() {
        let mut engine = engine();
        engine.execute_script("x", &json!({})).unwrap();
        assert!(engine.set_delimiters(DelimiterSet::default()).is_err());
    }

    #[test]
    fn module_imports_join_the_prelude_and_the_cache_key() {
        let mut engine = engine();
        engine.execute_script("a", &json!({})).unwrap();
        engine.add_module("json");
        let result = engine
            .execute_script("{{! json.encode(Model) }}", &json!({ "n": 1 }))
            .unwrap();
        assert_eq!(result, "{\"n\":1}");

        // Same template text, different prelude: distinct cache entries.
        let before = engine.compile_count();
        engine.execute_script("a", &json!({})).unwrap();
        assert_eq!(engine.compile_count(), before + 1);
    }

    #[test]
    fn compile_mode_separates_cache_entries() {
        let mut engine = engine();
        engine.execute_script("m", &json!({})).unwrap();
        engine.set_compile_mode(CompileMode::Release);
        engine.execute_script("m", &json!({})).unwrap();
        assert_eq!(engine.compile_count(), 2);
        assert_eq!(engine.cache_len(), 2);
    }
}

#[cfg(feature = "async-lua")]
mod async_execution {
    use super::*;

    #[tokio::test]
    async fn async_script_execution_awaits_the_result() {
        let engine = engine();
        let result = engine
            .execute_script_async("Hello {{ Model.Name }}!", &sam())
            .await
            .unwrap();
        assert_eq!(result, "Hello Sam!");
    }

    #[tokio::test]
    async fn async_snippet_execution() {
        let engine = engine();
        let result = engine
            .execute_code_async("return @0 * 2", &[json!(21)])
            .await
            .unwrap();
        assert_eq!(result, json!(42));
    }

    #[tokio::test]
    async fn async_failures_capture_like_sync_ones() {
        let engine = engine();
        let result = engine
            .execute_script_async("{{% script.partial(\"/nope.html\") %}}", &json!({}))
            .await
            .unwrap();
        assert_eq!(result, "");
        assert_eq!(engine.last_error().unwrap().kind, ErrorKind::Resolution);
    }
}
