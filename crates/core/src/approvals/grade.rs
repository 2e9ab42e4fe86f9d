use rust_decimal::Decimal;

/// Highest grade in the delegation-of-authority scale. Used as the
/// conservative default and as the second cascade tier.
pub const TOP_REFERENCE_GRADE: u8 = 54;

/// Approver grade required for an applicant grade and request value.
///
/// | applicant grade | value             | required |
/// |-----------------|-------------------|----------|
/// | >= 52           | any               | 54       |
/// | 44..=51         | > 20000           | 54       |
/// | 44..=51         | 10000 < v <= 20000| 52       |
/// | 44..=51         | <= 10000          | 48       |
/// | 41..=43         | > 10000           | 52       |
/// | 41..=43         | 5000 < v <= 10000 | 48       |
/// | 41..=43         | <= 5000           | 44       |
/// | < 41            | any               | 54       |
pub fn required_approver_grade(applicant_grade: u8, value: Decimal) -> u8 {
    let five_thousand = Decimal::new(5_000, 0);
    let ten_thousand = Decimal::new(10_000, 0);
    let twenty_thousand = Decimal::new(20_000, 0);

    match applicant_grade {
        52.. => TOP_REFERENCE_GRADE,
        44..=51 => {
            if value > twenty_thousand {
                54
            } else if value > ten_thousand {
                52
            } else {
                48
            }
        }
        41..=43 => {
            if value > ten_thousand {
                52
            } else if value > five_thousand {
                48
            } else {
                44
            }
        }
        _ => TOP_REFERENCE_GRADE,
    }
}
