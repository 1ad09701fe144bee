use std::collections::HashMap;
use std::sync::LazyLock;

/// (isotope mass, natural abundance) pairs, lightest isotope first.
static ISOTOPES: LazyLock<HashMap<&'static str, Vec<(f64, f64)>>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    map.insert("H", vec![(1.00782503223, 0.999885), (2.01410177812, 0.000115)]);
    map.insert("Li", vec![(6.0151228874, 0.0759), (7.0160034366, 0.9241)]);
    map.insert("B", vec![(10.01293695, 0.199), (11.00930536, 0.801)]);
    map.insert("C", vec![(12.0000000, 0.9893), (13.00335483507, 0.0107)]);
    map.insert("N", vec![(14.00307400443, 0.99636), (15.00010889888, 0.00364)]);
    map.insert("O", vec![(15.99491461957, 0.99757), (16.99913175650, 0.00038), (17.99915961286, 0.00205)]);
    map.insert("F", vec![(18.99840316273, 1.0)]);
    map.insert("Na", vec![(22.9897692820, 1.0)]);
    map.insert("Mg", vec![(23.985041697, 0.7899), (24.985836976, 0.1000), (25.982592968, 0.1101)]);
    map.insert("Al", vec![(26.98153853, 1.0)]);
    map.insert("Si", vec![(27.97692653465, 0.92223), (28.97649466490, 0.04685), (29.973770136, 0.03092)]);
    map.insert("P", vec![(30.97376199842, 1.0)]);
    map.insert("S", vec![(31.9720711744, 0.9499), (32.9714589098, 0.0075), (33.967867004, 0.0425), (35.96708071, 0.0001)]);
    map.insert("Cl", vec![(34.968852682, 0.7576), (36.965902602, 0.2424)]);
    map.insert("K", vec![(38.9637064864, 0.932581), (39.963998166, 0.000117), (40.9618252579, 0.067302)]);
    map.insert("Ca", vec![(39.962590863, 0.96941), (41.95861783, 0.00647), (42.95876644, 0.00135), (43.95548156, 0.02086), (45.9536890, 0.00004), (47.95252276, 0.00187)]);
    map.insert("Mn", vec![(54.93804391, 1.0)]);
    map.insert("Fe", vec![(53.93960899, 0.05845), (55.93493633, 0.91754), (56.93539284, 0.02119), (57.93327443, 0.00282)]);
    map.insert("Co", vec![(58.93319429, 1.0)]);
    map.insert("Ni", vec![(57.93534241, 0.68077), (59.93078588, 0.26223), (60.93105557, 0.011399), (61.92834537, 0.036346), (63.92796682, 0.009255)]);
    map.insert("Cu", vec![(62.92959772, 0.6915), (64.92778970, 0.3085)]);
    map.insert("Zn", vec![(63.92914201, 0.4917), (65.92603381, 0.2773), (66.92712775, 0.0404), (67.92484455, 0.1845), (69.9253192, 0.0061)]);
    map.insert("As", vec![(74.92159457, 1.0)]);
    map.insert("Se", vec![(73.922475934, 0.0089), (75.919213704, 0.0937), (76.919914154, 0.0763), (77.91730928, 0.2377), (79.9165218, 0.4961), (81.9166995, 0.0873)]);
    map.insert("Br", vec![(78.9183376, 0.5069), (80.9162897, 0.4931)]);
    map.insert("I", vec![(126.9044719, 1.0)]);
    map
});

/// Mass of the most abundant isotope of every element, the convention used
/// for monoisotopic compound masses.
static MONO_ISOTOPIC: LazyLock<HashMap<&'static str, f64>> = LazyLock::new(|| {
    ISOTOPES
        .iter()
        .filter_map(|(element, isotopes)| {
            isotopes
                .iter()
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|&(mass, _)| (*element, mass))
        })
        .collect()
});

pub fn atomic_weights_mono_isotopic() -> &'static HashMap<&'static str, f64> {
    &MONO_ISOTOPIC
}

pub fn isotopes(element: &str) -> Option<&'static [(f64, f64)]> {
    ISOTOPES.get(element).map(|v| v.as_slice())
}

pub fn is_known_element(element: &str) -> bool {
    ISOTOPES.contains_key(element)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abundances_sum_to_one() {
        for (element, isotopes) in ISOTOPES.iter() {
            let total: f64 = isotopes.iter().map(|(_, a)| a).sum();
            assert!((total - 1.0).abs() < 1e-3, "{element} abundances sum to {total}");
        }
    }

    #[test]
    fn test_mono_isotopic_uses_most_abundant_isotope() {
        let weights = atomic_weights_mono_isotopic();
        assert_eq!(weights["C"], 12.0);
        assert_eq!(weights["Fe"], 55.93493633);
        assert_eq!(weights["Br"], 78.9183376);
    }
}
