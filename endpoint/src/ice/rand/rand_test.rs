use super::*;

#[test]
fn test_credential_lengths() {
    assert_eq!(generate_ufrag().len(), 4);
    assert_eq!(generate_pwd().len(), 22);
}

#[test]
fn test_credential_alphabet() {
    for _ in 0..32 {
        for s in [generate_ufrag(), generate_pwd()] {
            for c in s.chars() {
                assert!(
                    c.is_ascii_alphanumeric() || c == '+' || c == '/',
                    "{c:?} outside the ice-char set in {s}"
                );
            }
        }
    }
}

#[test]
fn test_random_generator_collision() {
    const N: usize = 10;
    const ITERATION: usize = 10;

    for _ in 0..ITERATION {
        let mut rs = vec![];
        for _ in 0..N {
            rs.push(generate_pwd());
        }

        for i in 0..N {
            for j in i + 1..N {
                assert_ne!(
                    rs[i], rs[j],
                    "generate_pwd caused collision: {} == {}",
                    rs[i], rs[j],
                );
            }
        }
    }
}
