// (c) Roel Kluin, 2023, GPL v3

// Invariant checks that only cost something in debug builds.

#[macro_export]
macro_rules! dbg_assert {
	($cond:expr) => ({
		if cfg!(debug_assertions) && !$cond {
			panic!("[{}:{}] assertion failed: {}", file!(), line!(), stringify!($cond));
		}
	});
	($cond:expr, $($arg:tt)+) => ({
		if cfg!(debug_assertions) && !$cond {
			panic!("[{}:{}] {}", file!(), line!(), format_args!($($arg)+));
		}
	})
}

#[macro_export]
macro_rules! dbg_assert_eq {
	($left:expr, $right:expr) => ({
		if cfg!(debug_assertions) {
			match (&$left, &$right) {
				(l, r) => {
					if l != r {
						panic!(
							"[{}:{}] {} == {} failed: {:?} != {:?}",
							file!(), line!(), stringify!($left), stringify!($right), l, r
						);
					}
				}
			}
		}
	})
}
