//! End-to-end use of the registry-backed builtins from script code.

mod common;

use common::{eval, runtime_with_workers};

#[test]
fn fs_round_trips_text_through_the_worker_pool() {
    let (runtime, dir) = runtime_with_workers(|_| {}, 1);
    let file = dir.path().join("note.txt").display().to_string();

    eval::<()>(
        &runtime,
        &format!(
            r#"
            const fs = require("fs");
            globalThis.readBack = undefined;
            fs.writeTextFile({file:?}, "hello from script")
                .then(() => fs.readTextFile({file:?}))
                .then(text => {{ readBack = text; }});
            "#
        ),
    );
    runtime.run_until_idle();

    assert_eq!(eval::<String>(&runtime, "readBack"), "hello from script");
}

#[test]
fn fs_read_failures_reject() {
    let (runtime, _dir) = runtime_with_workers(|_| {}, 1);

    eval::<()>(
        &runtime,
        r#"
        globalThis.fsErr = undefined;
        require("fs").readTextFile("/no/such/file/anywhere")
            .catch(e => { fsErr = e.message; });
        "#,
    );
    runtime.run_until_idle();

    let msg: String = eval(&runtime, "fsErr");
    assert!(msg.contains("failed to read"), "unexpected: {msg}");
}

#[test]
fn fs_binary_io_uses_array_buffers() {
    let (runtime, dir) = runtime_with_workers(|_| {}, 1);
    let file = dir.path().join("blob.bin").display().to_string();

    eval::<()>(
        &runtime,
        &format!(
            r#"
            const fs = require("fs");
            globalThis.bytes = undefined;
            const data = new Uint8Array([7, 8, 9]);
            fs.writeFile({file:?}, data.buffer)
                .then(() => fs.readFile({file:?}))
                .then(buf => {{ bytes = Array.from(new Uint8Array(buf)); }});
            "#
        ),
    );
    runtime.run_until_idle();

    assert_eq!(eval::<Vec<u8>>(&runtime, "bytes"), vec![7, 8, 9]);
    assert_eq!(std::fs::read(dir.path().join("blob.bin")).unwrap(), vec![7, 8, 9]);
}

#[test]
fn read_dir_exposes_wrapped_entries() {
    let (runtime, dir) = runtime_with_workers(|_| {}, 1);
    std::fs::write(dir.path().join("one.ts"), "export {};").unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    let root = dir.path().display().to_string();

    let names: Vec<String> = eval(
        &runtime,
        &format!(
            r#"
            (function () {{
                const fs = require("fs");
                return fs.readDir({root:?})
                    .map(e => e.name + ":" + e.status.type)
                    .sort();
            }})()
            "#
        ),
    );

    // internal/ comes from the generated declarations.
    assert!(names.contains(&String::from("one.ts:1")));
    assert!(names.contains(&String::from("sub:2")));
}

#[test]
fn compiled_amd_output_runs_against_the_bindings() {
    let (runtime, _dir) = runtime_with_workers(
        |reg| {
            let i32_ty = reg.i32_type();
            reg.global_function(
                "triple",
                i32_ty.clone(),
                &[("v", i32_ty)],
                quickbind_reflect::wrap1(|v: &i32| v * 3),
            );
        },
        1,
    );

    // The shape tsc emits for `--module amd`.
    eval::<()>(
        &runtime,
        r#"
        define("lib/util", ["require", "exports"], function (require, exports) {
            "use strict";
            Object.defineProperty(exports, "__esModule", { value: true });
            exports.nine = triple(3);
        });
        define("main", ["require", "exports", "./lib/util"], function (require, exports, util) {
            "use strict";
            globalThis.answer = util.nine + triple(1);
        });
        "#,
    );
    runtime.require("main").unwrap();

    assert_eq!(eval::<f64>(&runtime, "answer"), 12.0);
}
