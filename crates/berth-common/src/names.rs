//! Human-readable random names for networks.

use rand::Rng;

const LEFT: &[&str] = &[
    "admiring", "agitated", "amazing", "angry", "awesome", "boring", "brave", "clever",
    "compassionate", "condescending", "cranky", "dazzling", "determined", "distracted",
    "dreamy", "eager", "ecstatic", "elastic", "elated", "elegant", "focused", "furious",
    "gallant", "gloomy", "goofy", "happy", "hopeful", "hungry", "jolly", "jovial", "kickass",
    "lonely", "loving", "mad", "modest", "naughty", "nostalgic", "pedantic", "pensive",
    "prickly", "reverent", "romantic", "sad", "serene", "sharp", "sick", "silly", "sleepy",
    "stoic", "stupefied", "suspicious", "tender", "thirsty", "trusting", "zen",
];

const RIGHT: &[&str] = &[
    "albattani", "allen", "almeida", "archimedes", "ardinghelli", "babbage", "banach",
    "bardeen", "bartik", "bell", "blackwell", "bohr", "brattain", "brown", "carson",
    "colden", "curie", "darwin", "davinci", "einstein", "elion", "engelbart", "euclid",
    "fermat", "fermi", "feynman", "franklin", "galileo", "goldstine", "goodall", "hawking",
    "heisenberg", "hodgkin", "hoover", "hopper", "hypatia", "jones", "kirch", "kowalevski",
    "lalande", "leakey", "lovelace", "lumiere", "mayer", "mccarthy", "mcclintock",
    "morse", "newton", "nobel", "pare", "pasteur", "perlman", "pike", "poincare",
    "ptolemy", "ritchie", "rosalind", "sammet", "shockley", "sinoussi", "stallman",
    "tesla", "thompson", "torvalds", "turing", "wilson", "wozniak", "wright", "yalow",
    "yonath",
];

/// Generate a random name in the form `adjective_surname`.
///
/// A non-zero `retry` appends a random digit, widening the name space for
/// callers that loop until they find an unused name.
#[must_use]
pub fn random_name(retry: usize) -> String {
    let mut rng = rand::rng();
    let left = LEFT[rng.random_range(0..LEFT.len())];
    let right = RIGHT[rng.random_range(0..RIGHT.len())];

    let mut name = format!("{left}_{right}");
    if retry > 0 {
        name.push(char::from(b'0' + rng.random_range(0..10u8)));
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_has_two_parts() {
        let name = random_name(0);
        let (left, right) = name.split_once('_').unwrap();
        assert!(LEFT.contains(&left));
        assert!(RIGHT.contains(&right));
    }

    #[test]
    fn retry_appends_digit() {
        let name = random_name(3);
        assert!(name.chars().last().unwrap().is_ascii_digit());
    }
}
