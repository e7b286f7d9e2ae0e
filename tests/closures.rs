use gscript::run;
use gscript::HostValue;

#[test]
fn test_basic_closure() {
    let source = r#"
        let x = "global"
        fn makeClosure() {
            let y = "captured"
            fn inner() {
                return x + " " + y
            }
            return inner
        }
        let closure = makeClosure()
        let result = closure()
        result
    "#;
    let result = run(source).expect("Execution failed");
    assert_eq!(result, HostValue::from("global captured"));
}

#[test]
fn test_counter_state() {
    let source = r#"
        fn makeCounter() {
            var i = 0
            fn count() {
                i = i + 1
                return i
            }
            return count
        }
        let c1 = makeCounter()
        let c2 = makeCounter()
        let r1 = c1()
        let r2 = c1()
        let r3 = c2()

        "" + r1 + "," + r2 + "," + r3
    "#;
    let result = run(source).expect("Execution failed");
    assert_eq!(result, HostValue::from("1,2,1"));
}

#[test]
fn test_close_upvalue() {
    // `a` must survive after make() returns
    let source = r#"
        fn outer() {
            let i = 0

            fn make() {
                let a = "first"
                fn f() { return a }
                return f
            }

            let f1 = make()
            return f1()
        }
        outer()
    "#;
    let result = run(source).expect("Execution failed");
    assert_eq!(result, HostValue::from("first"));
}

#[test]
fn test_loop_variables_are_captured_per_iteration() {
    let source = r#"
        let fns = []
        for n in [1, 2, 3] {
            let captured = n
            push(fns, fn_returning(captured))
        }
        fn fn_returning(v) {
            fn get() { return v }
            return get
        }
        ""
    "#;
    // fn_returning is declared after the loop runs
    assert!(run(source).is_err());

    let source = r#"
        fn fn_returning(v) {
            fn get() { return v }
            return get
        }
        let fns = []
        for n in [1, 2, 3] {
            push(fns, fn_returning(n))
        }
        fns[0]() + fns[1]() + fns[2]()
    "#;
    assert_eq!(run(source).unwrap(), HostValue::Number(6.0));
}

#[test]
fn test_closure_in_record_field() {
    let source = r#"
        fn counter() {
            var n = 0
            fn inc() { n = n + 1
                return n }
            return { inc: inc }
        }
        let c = counter()
        c.inc()
        c.inc()
    "#;
    assert_eq!(run(source).unwrap(), HostValue::Number(2.0));
}

#[test]
fn test_captured_let_is_immutable() {
    let source = r#"
        fn outer() {
            let fixed = 1
            fn inner() { fixed = 2 }
            return inner
        }
    "#;
    let err = run(source).unwrap_err();
    assert!(err.is_syntax());
}
