use std::{fs, thread};

use rubygate::{BlockReturn, Error, FromRuby, ToRuby, VM, VMState};

const SCRIPT: &str = "\
module Shared
  GREETING = \"hello\"
  SIZES = [1, 2, 3]
end
";

// The singleton is process-wide, so everything that touches it runs in one test, in order.
#[test]
fn process_singleton_lifecycle() {
    let vm = VM::shared();
    assert!(std::ptr::eq(vm, VM::shared()), "one VM per process");
    assert_eq!(vm.state(), VMState::Unknown, "nothing is started eagerly");

    let id = vm.get_id("each").unwrap();
    assert_eq!(vm.state(), VMState::Setup, "first use brings the VM up");
    assert_eq!(vm.setup(), Ok(false));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            thread::spawn(|| {
                (0..50)
                    .map(|n| VM::shared().get_id(&format!("name_{n}")).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results.windows(2).all(|pair| pair[0] == pair[1]), "every thread sees the same ids");
    assert_eq!(vm.get_id("each").unwrap(), id);

    let path = std::env::temp_dir().join(format!("rubygate-shared-{}.rb", std::process::id()));
    fs::write(&path, SCRIPT).unwrap();
    vm.load(&path, false).unwrap();
    fs::remove_file(&path).unwrap();

    let greeting = vm.get_constant("Shared::GREETING").unwrap();
    assert_eq!(String::from_ruby(vm, greeting), Some("hello".to_string()));

    let sizes = vm.get_constant("Shared::SIZES").unwrap();
    let mut total = 0;
    vm.call_with_block(sizes, "each", &[], |args| {
        total += i64::from_ruby(VM::shared(), args[0]).unwrap_or_default();
        BlockReturn::Value(VM::shared().nil())
    })
    .unwrap();
    assert_eq!(total, 6);

    let missing = vm.get_constant("Shared::NOPE").unwrap_err();
    assert!(missing.exception().is_some(), "NameError comes back wrapped: {missing}");
    assert_eq!(vm.history().most_recent(), Some(missing));

    assert_eq!(vm.cleanup(), 0);
    assert_eq!(vm.state(), VMState::CleanedUp);
    assert!(matches!(vm.get_id("later"), Err(Error::Setup(_))));
    assert!(matches!(1_i32.to_ruby(vm), Err(Error::Setup(_))));
}
